//! Normalized catalog entities and search facets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Files at or below this size fall into [`SizeBucket::Less800`].
pub const SIZE_BUCKET_THRESHOLD_BYTES: i64 = 800 * 1024;

/// Highest rating a book can carry.
pub const MAX_RATING: u8 = 5;

/// Coarse file-size filter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SizeBucket {
    Less800,
    More800,
}

impl SizeBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            SizeBucket::Less800 => "less800",
            SizeBucket::More800 => "more800",
        }
    }

    pub fn for_size(size_bytes: i64) -> Self {
        if size_bytes <= SIZE_BUCKET_THRESHOLD_BYTES {
            SizeBucket::Less800
        } else {
            SizeBucket::More800
        }
    }
}

impl FromStr for SizeBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "less800" => Ok(SizeBucket::Less800),
            "more800" => Ok(SizeBucket::More800),
            other => Err(format!("unknown size bucket '{other}'")),
        }
    }
}

/// Which full-text source a query runs against.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SearchArea {
    /// Title, author, genre, series, year and language.
    #[default]
    Primary,
    BookAnnotations,
    AuthorAnnotations,
}

impl SearchArea {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchArea::Primary => "primary",
            SearchArea::BookAnnotations => "book-annotations",
            SearchArea::AuthorAnnotations => "author-annotations",
        }
    }
}

impl FromStr for SearchArea {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "b" => Ok(SearchArea::Primary),
            "book-annotations" | "ba" => Ok(SearchArea::BookAnnotations),
            "author-annotations" | "aa" => Ok(SearchArea::AuthorAnnotations),
            other => Err(format!("unknown search area '{other}'")),
        }
    }
}

/// Drill-down target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Scope {
    Series(i64),
    Author(i64),
}

/// Filter dimensions applied on top of the text query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Facets {
    /// Exact language code, compared case-insensitively.
    pub language: Option<String>,
    pub size_bucket: Option<SizeBucket>,
    /// Accepted rounded ratings; empty means no filter.
    pub ratings: BTreeSet<u8>,
    pub search_area: SearchArea,
    pub scope: Option<Scope>,
}

impl Facets {
    pub fn with_scope(&self, scope: Scope) -> Self {
        Self {
            scope: Some(scope),
            ..self.clone()
        }
    }
}

/// The three result views.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    #[default]
    Books,
    Series,
    Authors,
}

impl ResultKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultKind::Books => "books",
            ResultKind::Series => "series",
            ResultKind::Authors => "authors",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "books" => Ok(ResultKind::Books),
            "series" => Ok(ResultKind::Series),
            "authors" => Ok(ResultKind::Authors),
            other => Err(format!("unknown result view '{other}'")),
        }
    }
}

/// Ordering applied to the books view. Ties always break on `file_id` ascending.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookOrder {
    #[default]
    Relevance,
    /// Publication year, newest first; books without a year go last.
    Newest,
    Title,
}

impl FromStr for BookOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relevance" => Ok(BookOrder::Relevance),
            "newest" => Ok(BookOrder::Newest),
            "title" => Ok(BookOrder::Title),
            other => Err(format!("unknown book order '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Book {
    /// Catalog primary key.
    pub file_id: i64,
    pub title: String,
    pub last_name: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub author_id: Option<i64>,
    pub genre: Option<String>,
    pub series_title: Option<String>,
    pub series_id: Option<i64>,
    pub year: Option<i64>,
    pub language: Option<String>,
    pub size_bytes: i64,
    /// Rounded average rating, 0 when unrated.
    pub rating: u8,
    pub relevance: f64,
}

impl Book {
    /// "Last First Middle" with empty parts skipped.
    pub fn author_name(&self) -> String {
        join_name_parts(
            self.last_name.as_deref(),
            self.first_name.as_deref(),
            self.middle_name.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesAggregate {
    pub series_title: String,
    pub series_id: i64,
    pub book_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorAggregate {
    pub author_name: String,
    pub author_id: i64,
    pub book_count: usize,
}

/// Items of one result view, kept homogeneous by construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "items", rename_all = "lowercase")]
pub enum ResultItems {
    Books(Vec<Book>),
    Series(Vec<SeriesAggregate>),
    Authors(Vec<AuthorAggregate>),
}

impl ResultItems {
    pub fn empty(kind: ResultKind) -> Self {
        match kind {
            ResultKind::Books => ResultItems::Books(Vec::new()),
            ResultKind::Series => ResultItems::Series(Vec::new()),
            ResultKind::Authors => ResultItems::Authors(Vec::new()),
        }
    }

    pub fn kind(&self) -> ResultKind {
        match self {
            ResultItems::Books(_) => ResultKind::Books,
            ResultItems::Series(_) => ResultKind::Series,
            ResultItems::Authors(_) => ResultKind::Authors,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResultItems::Books(v) => v.len(),
            ResultItems::Series(v) => v.len(),
            ResultItems::Authors(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the items in `range`. The range must lie within `0..len()`.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        match self {
            ResultItems::Books(v) => ResultItems::Books(v[range].to_vec()),
            ResultItems::Series(v) => ResultItems::Series(v[range].to_vec()),
            ResultItems::Authors(v) => ResultItems::Authors(v[range].to_vec()),
        }
    }
}

/// A shaped, ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultSet {
    pub items: ResultItems,
    pub total_count: usize,
    /// Facets the set was produced with.
    pub facets: Facets,
    /// Query text the set was produced from; drill-downs reuse it.
    pub query: String,
}

impl ResultSet {
    pub fn new(items: ResultItems, facets: Facets, query: impl Into<String>) -> Self {
        let total_count = items.len();
        Self {
            items,
            total_count,
            facets,
            query: query.into(),
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.items.kind()
    }
}

pub(crate) fn join_name_parts(
    last: Option<&str>,
    first: Option<&str>,
    middle: Option<&str>,
) -> String {
    [last, first, middle]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_bucket_boundary_is_inclusive() {
        assert_eq!(SizeBucket::for_size(800 * 1024), SizeBucket::Less800);
        assert_eq!(SizeBucket::for_size(800 * 1024 + 1), SizeBucket::More800);
        assert_eq!(SizeBucket::for_size(0), SizeBucket::Less800);
    }

    #[test]
    fn parses_legacy_area_codes() {
        assert_eq!("b".parse::<SearchArea>().unwrap(), SearchArea::Primary);
        assert_eq!(
            "ba".parse::<SearchArea>().unwrap(),
            SearchArea::BookAnnotations
        );
        assert!("nope".parse::<SearchArea>().is_err());
    }

    #[test]
    fn author_name_skips_empty_parts() {
        assert_eq!(join_name_parts(Some("Толстой"), Some(""), Some("Николаевич")), "Толстой Николаевич");
        assert_eq!(join_name_parts(None, Some("  "), None), "");
    }

    #[test]
    fn result_set_total_matches_items() {
        let set = ResultSet::new(
            ResultItems::Series(vec![SeriesAggregate {
                series_title: "Дюна".into(),
                series_id: 7,
                book_count: 3,
            }]),
            Facets::default(),
            "дюна",
        );
        assert_eq!(set.total_count, 1);
        assert_eq!(set.kind(), ResultKind::Series);
    }
}
