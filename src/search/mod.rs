//! Search layer facade.
//!
//! - **[`normalize`]**: raw query text into word tokens or field criteria.
//! - **[`predicate`]**: tokens/criteria plus facets into a parameterized predicate.
//! - **[`executor`]**: runs a predicate against one of the three full-text sources.
//! - **[`shaper`]**: raw rows into the books, series or authors view.
//! - **[`query`]**: the engine tying these to the session cache.

pub mod error;
pub mod executor;
pub mod normalize;
pub mod predicate;
pub mod query;
pub mod shaper;

pub use error::SearchError;
pub use query::{SearchEngine, SearchRequest};
