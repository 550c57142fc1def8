//! Per-user and per-conversation result caching.

pub mod pagination;
pub mod store;
pub mod sweeper;

pub use pagination::{Page, PaginationCache, page_of};
pub use store::{InMemorySessionStore, SessionKey, SessionKind, SessionSearchState, SessionStore};
pub use sweeper::SessionSweeper;
