//! The search engine: normalize, compile, execute, shape, cache.

use crate::config::EngineConfig;
use crate::model::types::{BookOrder, Facets, ResultItems, ResultKind, ResultSet, Scope};
use crate::search::error::SearchError;
use crate::search::executor;
use crate::search::normalize::normalize;
use crate::search::predicate::{CompiledPredicate, compile};
use crate::search::shaper;
use crate::session::{
    InMemorySessionStore, Page, PaginationCache, SessionKey, SessionStore, SessionSweeper, page_of,
};
use crate::storage::details::{self, AuthorDetails, BookDetails};
use crate::storage::pool::ConnectionPool;
use crate::storage::reference::ReferenceCache;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Text plus facets, and which view to shape the rows into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub facets: Facets,
    pub kind: ResultKind,
    pub order: BookOrder,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, facets: Facets, kind: ResultKind) -> Self {
        Self {
            query: query.into(),
            facets,
            kind,
            order: BookOrder::default(),
        }
    }
}

/// Compile a request, reporting a predicate that can match nothing as
/// [`SearchError::EmptyQuery`].
pub fn compile_request(request: &SearchRequest) -> Result<CompiledPredicate, SearchError> {
    let compiled = compile(&normalize(&request.query), &request.facets);
    if compiled.is_always_false() {
        return Err(SearchError::EmptyQuery);
    }
    Ok(compiled)
}

pub struct SearchEngine {
    pool: Arc<ConnectionPool>,
    sessions: PaginationCache,
    reference: ReferenceCache,
    row_cap: usize,
}

impl SearchEngine {
    /// Engine over the catalog named in `config`, with in-memory sessions.
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_store(
            config,
            Arc::new(InMemorySessionStore::new(config.max_sessions)),
        )
    }

    pub fn with_store(config: &EngineConfig, store: Arc<dyn SessionStore>) -> Self {
        let pool = Arc::new(
            ConnectionPool::new(&config.db_path, config.pool_size, config.checkout_timeout)
                .with_busy_timeout(config.busy_timeout),
        );
        Self {
            reference: ReferenceCache::new(Arc::clone(&pool)),
            sessions: PaginationCache::new(store),
            pool,
            row_cap: config.row_cap.max(1),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn reference(&self) -> &ReferenceCache {
        &self.reference
    }

    pub fn sessions(&self) -> &PaginationCache {
        &self.sessions
    }

    /// Start TTL eviction over this engine's session store.
    pub fn spawn_sweeper(&self, ttl: Duration, interval: Duration) -> std::io::Result<SessionSweeper> {
        SessionSweeper::spawn(Arc::clone(self.sessions.store_handle()), ttl, interval)
    }

    /// Run one search. A query with nothing to match yields an empty set.
    pub fn search(&self, request: &SearchRequest) -> Result<ResultSet, SearchError> {
        let start = Instant::now();
        tracing::info!(
            backend = "sqlite",
            query = request.query.as_str(),
            kind = request.kind.as_str(),
            area = request.facets.search_area.as_str(),
            "search_start"
        );

        let compiled = match compile_request(request) {
            Ok(compiled) => compiled,
            Err(SearchError::EmptyQuery) => {
                tracing::info!(query = request.query.as_str(), "search_empty_query");
                return Ok(ResultSet::new(
                    ResultItems::empty(request.kind),
                    request.facets.clone(),
                    request.query.clone(),
                ));
            }
            Err(err) => return Err(err),
        };

        let rows = self.with_connection(|conn| {
            executor::execute(conn, request.facets.search_area, &compiled, self.row_cap)
        })?;
        let raw_rows = rows.len();
        let items = shaper::shape(rows, request.kind, request.order);
        let result = ResultSet::new(items, request.facets.clone(), request.query.clone());

        tracing::info!(
            raw_rows,
            results = result.total_count,
            elapsed_ms = start.elapsed().as_millis(),
            "search_done"
        );
        Ok(result)
    }

    /// Search and cache the result under `key`, returning its first page.
    /// On failure the previous state under `key` is left as it was.
    ///
    /// Searches on one key publish in the order they began: if a search
    /// that started later has already published, this one fails with
    /// [`SearchError::Superseded`] and its result is dropped.
    pub fn search_into_session(
        &self,
        key: SessionKey,
        request: &SearchRequest,
        page_size: usize,
    ) -> Result<Page, SearchError> {
        let generation = self.sessions.reserve();
        self.publish_search(key, request, page_size, generation)
    }

    fn publish_search(
        &self,
        key: SessionKey,
        request: &SearchRequest,
        page_size: usize,
        generation: u64,
    ) -> Result<Page, SearchError> {
        let result = self.search(request)?;
        let state = self.sessions.publish(key, result, page_size, generation)?;
        // Cut from our own snapshot; the key may already hold something newer.
        page_of(&state, 0)
    }

    pub fn get_page(
        &self,
        key: &SessionKey,
        kind: ResultKind,
        page_index: usize,
    ) -> Result<Page, SearchError> {
        self.sessions.get_page(key, kind, page_index)
    }

    /// Books of one series or author, reusing the query and facets cached
    /// under `key`. The books view replaces the cached set.
    pub fn drill_down(
        &self,
        key: SessionKey,
        scope: Scope,
        page_size: usize,
    ) -> Result<Page, SearchError> {
        let generation = self.sessions.reserve();
        let state = self.sessions.state(&key).ok_or(SearchError::SessionExpired)?;
        let request = SearchRequest {
            query: state.result.query.clone(),
            facets: state.result.facets.with_scope(scope),
            kind: ResultKind::Books,
            order: BookOrder::default(),
        };
        tracing::debug!(session = %key, ?scope, "drill_down");
        self.publish_search(key, &request, page_size, generation)
    }

    /// Re-run the query cached under `key` in another view. A drill-down
    /// scope is dropped, so the new view covers the whole query again.
    pub fn switch_view(
        &self,
        key: SessionKey,
        kind: ResultKind,
        page_size: usize,
    ) -> Result<Page, SearchError> {
        let generation = self.sessions.reserve();
        let state = self.sessions.state(&key).ok_or(SearchError::SessionExpired)?;
        let mut request = SearchRequest::new(
            state.result.query.clone(),
            state.result.facets.clone(),
            kind,
        );
        request.facets.scope = None;
        tracing::debug!(session = %key, kind = kind.as_str(), "switch_view");
        self.publish_search(key, &request, page_size, generation)
    }

    /// Card for one live book, or `None` if unknown or deleted.
    pub fn book_details(&self, file_id: i64) -> Result<Option<BookDetails>, SearchError> {
        self.with_connection(|conn| details::book_details(conn, file_id))
    }

    pub fn author_details(&self, author_id: i64) -> Result<Option<AuthorDetails>, SearchError> {
        self.with_connection(|conn| details::author_details(conn, author_id))
    }

    pub fn invalidate_session(&self, key: &SessionKey) -> bool {
        self.sessions.invalidate(key)
    }

    /// [`search`](Self::search) on tokio's blocking pool.
    pub async fn search_async(
        self: Arc<Self>,
        request: SearchRequest,
    ) -> Result<ResultSet, SearchError> {
        tokio::task::spawn_blocking(move || self.search(&request))
            .await
            .map_err(|e| SearchError::Programming(format!("search task failed: {e}")))?
    }

    /// [`search_into_session`](Self::search_into_session) on tokio's blocking pool.
    pub async fn search_into_session_async(
        self: Arc<Self>,
        key: SessionKey,
        request: SearchRequest,
        page_size: usize,
    ) -> Result<Page, SearchError> {
        tokio::task::spawn_blocking(move || self.search_into_session(key, &request, page_size))
            .await
            .map_err(|e| SearchError::Programming(format!("search task failed: {e}")))?
    }

    /// Run `f` on a pooled connection, retrying once on a transient failure.
    /// A connection that failed with an I/O error is closed first so the
    /// retry opens a fresh one.
    fn with_connection<T>(
        &self,
        f: impl Fn(&Connection) -> Result<T, SearchError>,
    ) -> Result<T, SearchError> {
        let mut retried = false;
        loop {
            let conn = self.pool.get()?;
            match f(&conn) {
                Err(err) if err.is_transient() && !retried => {
                    tracing::warn!(error = %err, "transient backend error, retrying");
                    if err.breaks_connection() {
                        conn.discard();
                    }
                    retried = true;
                }
                Err(err) if err.is_transient() => {
                    tracing::error!(error = %err, "backend still unavailable after retry");
                    return Err(err);
                }
                Err(err @ SearchError::Programming(_)) => {
                    tracing::error!(error = %err, "search failed with an internal error");
                    return Err(err);
                }
                other => return other,
            }
        }
    }
}
