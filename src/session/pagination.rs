//! Fixed-size pages over cached result sets.

use crate::model::types::{ResultItems, ResultKind, ResultSet};
use crate::search::error::SearchError;
use crate::session::store::{SessionKey, SessionSearchState, SessionStore};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Page {
    pub items: ResultItems,
    pub page_index: usize,
    pub page_count: usize,
    pub total_count: usize,
    /// Generation of the state this page was cut from.
    pub generation: u64,
}

impl Page {
    pub fn has_next(&self) -> bool {
        self.page_index + 1 < self.page_count
    }

    pub fn has_prev(&self) -> bool {
        self.page_index > 0
    }
}

pub struct PaginationCache {
    store: Arc<dyn SessionStore>,
}

impl PaginationCache {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store_handle(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Cache `result` under `key`, replacing whatever was there.
    pub fn store(
        &self,
        key: SessionKey,
        result: ResultSet,
        page_size: usize,
    ) -> Arc<SessionSearchState> {
        let state = self.store.set(key, result, page_size);
        tracing::debug!(
            session = %key,
            kind = state.result.kind().as_str(),
            total = state.result.total_count,
            pages = state.page_count(),
            generation = state.generation,
            "session_stored"
        );
        state
    }

    /// Reserve the generation a search about to run will publish under.
    pub fn reserve(&self) -> u64 {
        self.store.reserve_generation()
    }

    /// Cache `result` under `key` as `generation`. Fails with
    /// [`SearchError::Superseded`] when a search that began later has
    /// already published there.
    pub fn publish(
        &self,
        key: SessionKey,
        result: ResultSet,
        page_size: usize,
        generation: u64,
    ) -> Result<Arc<SessionSearchState>, SearchError> {
        let kind = result.kind();
        let Some(state) = self.store.publish(key, result, page_size, generation) else {
            tracing::debug!(
                session = %key,
                kind = kind.as_str(),
                generation,
                "session_publish_superseded"
            );
            return Err(SearchError::Superseded);
        };
        tracing::debug!(
            session = %key,
            kind = kind.as_str(),
            total = state.result.total_count,
            pages = state.page_count(),
            generation,
            "session_stored"
        );
        Ok(state)
    }

    /// Page `page_index` (0-based) of the `kind` view cached under `key`.
    ///
    /// A stored empty set yields an empty page 0. A missing key, or a key
    /// holding a different view, is [`SearchError::SessionExpired`].
    pub fn get_page(
        &self,
        key: &SessionKey,
        kind: ResultKind,
        page_index: usize,
    ) -> Result<Page, SearchError> {
        let state = self.store.get(key).ok_or(SearchError::SessionExpired)?;
        if state.result.kind() != kind {
            tracing::debug!(
                session = %key,
                stored = state.result.kind().as_str(),
                requested = kind.as_str(),
                "session holds a different view"
            );
            return Err(SearchError::SessionExpired);
        }
        page_of(&state, page_index)
    }

    /// Page of the view cached under `key`, whatever its kind.
    pub fn current_page(&self, key: &SessionKey, page_index: usize) -> Result<Page, SearchError> {
        let state = self.store.get(key).ok_or(SearchError::SessionExpired)?;
        page_of(&state, page_index)
    }

    /// Snapshot of the state under `key`.
    pub fn state(&self, key: &SessionKey) -> Option<Arc<SessionSearchState>> {
        self.store.get(key)
    }

    pub fn invalidate(&self, key: &SessionKey) -> bool {
        let removed = self.store.delete(key);
        if removed {
            tracing::debug!(session = %key, "session_invalidated");
        }
        removed
    }
}

/// Page `page_index` of `state`. Works on a snapshot, so the page always
/// comes from that state even if the key has since been replaced.
pub fn page_of(state: &SessionSearchState, page_index: usize) -> Result<Page, SearchError> {
    let total = state.result.total_count;
    let page_count = state.page_count();
    if page_index >= page_count.max(1) {
        return Err(SearchError::PageOutOfRange {
            requested: page_index,
            page_count,
        });
    }
    let start = (page_index * state.page_size).min(total);
    let end = (start + state.page_size).min(total);
    Ok(Page {
        items: state.result.items.slice(start..end),
        page_index,
        page_count,
        total_count: total,
        generation: state.generation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::{Facets, SeriesAggregate};
    use crate::session::store::InMemorySessionStore;

    fn series_set(n: usize) -> ResultSet {
        let items = (0..n)
            .map(|i| SeriesAggregate {
                series_title: format!("S{i:03}"),
                series_id: i as i64,
                book_count: 1,
            })
            .collect();
        ResultSet::new(ResultItems::Series(items), Facets::default(), "q")
    }

    fn cache() -> PaginationCache {
        PaginationCache::new(Arc::new(InMemorySessionStore::new(16)))
    }

    #[test]
    fn missing_key_is_expired_not_empty() {
        let err = cache()
            .get_page(&SessionKey::user(1), ResultKind::Books, 0)
            .unwrap_err();
        assert!(matches!(err, SearchError::SessionExpired));
    }

    #[test]
    fn pages_follow_the_pagination_law() {
        let cache = cache();
        let key = SessionKey::user(1);
        cache.store(key, series_set(57), 20);

        let sizes: Vec<usize> = (0..3)
            .map(|i| cache.get_page(&key, ResultKind::Series, i).unwrap().items.len())
            .collect();
        assert_eq!(sizes, vec![20, 20, 17]);

        let last = cache.get_page(&key, ResultKind::Series, 2).unwrap();
        assert_eq!(last.page_count, 3);
        assert!(!last.has_next());
        assert!(last.has_prev());
    }

    #[test]
    fn out_of_range_index() {
        let cache = cache();
        let key = SessionKey::user(1);
        cache.store(key, series_set(5), 20);
        let err = cache.get_page(&key, ResultKind::Series, 1).unwrap_err();
        assert!(matches!(
            err,
            SearchError::PageOutOfRange {
                requested: 1,
                page_count: 1
            }
        ));
    }

    #[test]
    fn kind_mismatch_is_expired() {
        let cache = cache();
        let key = SessionKey::conversation(-5);
        cache.store(key, series_set(5), 20);
        assert!(matches!(
            cache.get_page(&key, ResultKind::Authors, 0),
            Err(SearchError::SessionExpired)
        ));
        assert!(cache.current_page(&key, 0).is_ok());
    }

    #[test]
    fn stored_empty_set_has_an_empty_first_page() {
        let cache = cache();
        let key = SessionKey::user(1);
        cache.store(key, series_set(0), 20);
        let page = cache.get_page(&key, ResultKind::Series, 0).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.page_count, 0);
        assert!(cache.get_page(&key, ResultKind::Series, 1).is_err());
    }

    #[test]
    fn superseded_publish_keeps_the_newer_state() {
        let cache = cache();
        let key = SessionKey::user(1);
        let older = cache.reserve();
        let newer = cache.reserve();
        let state = cache.publish(key, series_set(3), 20, newer).unwrap();
        assert_eq!(page_of(&state, 0).unwrap().generation, newer);

        assert!(matches!(
            cache.publish(key, series_set(50), 20, older),
            Err(SearchError::Superseded)
        ));
        assert_eq!(
            cache.get_page(&key, ResultKind::Series, 0).unwrap().total_count,
            3
        );
    }

    #[test]
    fn invalidate_then_expired() {
        let cache = cache();
        let key = SessionKey::user(1);
        cache.store(key, series_set(3), 20);
        assert!(cache.invalidate(&key));
        assert!(!cache.invalidate(&key));
        assert!(matches!(
            cache.get_page(&key, ResultKind::Series, 0),
            Err(SearchError::SessionExpired)
        ));
    }
}
