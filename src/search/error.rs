//! Search error taxonomy.

use thiserror::Error;

/// Errors surfaced by the search engine and the session cache.
///
/// Callers distinguish [`SearchError::SessionExpired`] from an empty result so
/// they can prompt for a fresh search instead of reporting zero matches.
#[derive(Debug, Error)]
pub enum SearchError {
    /// The query compiled to the always-false predicate.
    #[error("query has nothing to search for")]
    EmptyQuery,

    /// Busy/locked/IO failure talking to the catalog, after the retry.
    #[error("catalog backend unavailable: {0}")]
    Backend(#[source] rusqlite::Error),

    /// No cached result set under the key, or it holds a different view.
    #[error("search session expired, run a new search")]
    SessionExpired,

    /// A search that began later already replaced the session; this
    /// result was not cached.
    #[error("a newer search replaced this one")]
    Superseded,

    #[error("page {requested} is out of range (page count {page_count})")]
    PageOutOfRange { requested: usize, page_count: usize },

    /// A bug: malformed SQL or placeholders not matching parameters.
    #[error("internal query error: {0}")]
    Programming(String),

    #[error("catalog storage error: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] crate::storage::pool::PoolError),
}

impl SearchError {
    /// Sort a rusqlite error into transient, programming or storage failures.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        if is_transient(&err) {
            return SearchError::Backend(err);
        }
        match err {
            rusqlite::Error::InvalidParameterCount(got, expected) => SearchError::Programming(
                format!("bound {got} parameters, statement expects {expected}"),
            ),
            rusqlite::Error::InvalidColumnIndex(_)
            | rusqlite::Error::InvalidColumnName(_)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::InvalidParameterName(_)
            | rusqlite::Error::SqlInputError { .. } => SearchError::Programming(err.to_string()),
            rusqlite::Error::SqliteFailure(ref e, ref msg)
                if e.code == rusqlite::ErrorCode::Unknown
                    && msg.as_deref().is_some_and(|m| m.contains("syntax error")) =>
            {
                SearchError::Programming(err.to_string())
            }
            other => SearchError::Storage(other),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SearchError::Backend(_))
    }

    /// Whether the connection that raised this error should be closed
    /// rather than reused. Busy and locked leave the connection healthy.
    pub fn breaks_connection(&self) -> bool {
        match self {
            SearchError::Backend(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::SystemIoFailure | rusqlite::ErrorCode::CannotOpen
            ),
            _ => false,
        }
    }
}

/// Whether retrying the same statement could succeed.
pub fn is_transient(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::SystemIoFailure
                | rusqlite::ErrorCode::CannotOpen
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(code: std::os::raw::c_int, msg: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), Some(msg.to_string()))
    }

    #[test]
    fn busy_and_locked_are_transient() {
        assert!(SearchError::from_sqlite(failure(rusqlite::ffi::SQLITE_BUSY, "busy")).is_transient());
        assert!(
            SearchError::from_sqlite(failure(rusqlite::ffi::SQLITE_LOCKED, "locked")).is_transient()
        );
    }

    #[test]
    fn only_io_failures_break_the_connection() {
        assert!(!SearchError::from_sqlite(failure(rusqlite::ffi::SQLITE_BUSY, "busy")).breaks_connection());
        assert!(
            SearchError::from_sqlite(failure(rusqlite::ffi::SQLITE_IOERR, "disk I/O error"))
                .breaks_connection()
        );
        assert!(!SearchError::EmptyQuery.breaks_connection());
    }

    #[test]
    fn parameter_mismatch_is_a_programming_error() {
        let err = SearchError::from_sqlite(rusqlite::Error::InvalidParameterCount(2, 3));
        assert!(matches!(err, SearchError::Programming(_)));
    }

    #[test]
    fn syntax_error_is_a_programming_error() {
        let err = SearchError::from_sqlite(failure(rusqlite::ffi::SQLITE_ERROR, "near \"WHERE\": syntax error"));
        assert!(matches!(err, SearchError::Programming(_)));
    }

    #[test]
    fn other_failures_are_storage_errors() {
        let err = SearchError::from_sqlite(failure(rusqlite::ffi::SQLITE_ERROR, "no such table: books"));
        assert!(matches!(err, SearchError::Storage(_)));
    }
}
