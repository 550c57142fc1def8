//! Process-wide reference data: language list and genre taxonomy.
//!
//! Loaded on first use behind a single-flight cell. `refresh()` is the only
//! invalidation; it swaps in a fresh cell so readers holding the old data keep
//! a consistent snapshot.

use crate::search::error::SearchError;
use crate::storage::pool::ConnectionPool;
use itertools::Itertools;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LanguageCount {
    pub code: String,
    pub books: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GenreEntry {
    pub code: String,
    pub description: String,
    pub books: i64,
}

/// Top-level genre group and its members.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GenreGroup {
    pub meta: String,
    pub genres: Vec<GenreEntry>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReferenceData {
    /// Most used first.
    pub languages: Vec<LanguageCount>,
    /// Ordered by group name, members by description.
    pub genres: Vec<GenreGroup>,
}

impl ReferenceData {
    pub fn has_language(&self, code: &str) -> bool {
        self.languages
            .iter()
            .any(|l| l.code.eq_ignore_ascii_case(code.trim()))
    }

    pub fn genre_group(&self, meta: &str) -> Option<&GenreGroup> {
        self.genres
            .iter()
            .find(|g| g.meta.to_lowercase() == meta.trim().to_lowercase())
    }
}

pub struct ReferenceCache {
    pool: Arc<ConnectionPool>,
    cell: RwLock<Arc<OnceCell<Arc<ReferenceData>>>>,
}

impl ReferenceCache {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            cell: RwLock::new(Arc::new(OnceCell::new())),
        }
    }

    /// Cached data, loading it if this is the first call since start or refresh.
    pub fn get(&self) -> Result<Arc<ReferenceData>, SearchError> {
        let cell = Arc::clone(&self.cell.read());
        cell.get_or_try_init(|| self.load().map(Arc::new))
            .map(Arc::clone)
    }

    /// Drop the cached data and load it again.
    pub fn refresh(&self) -> Result<Arc<ReferenceData>, SearchError> {
        *self.cell.write() = Arc::new(OnceCell::new());
        self.get()
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.read().get().is_some()
    }

    fn load(&self) -> Result<ReferenceData, SearchError> {
        let start = Instant::now();
        let conn = self.pool.get()?;

        let mut stmt = conn
            .prepare(
                "SELECT MIN(lang), COUNT(*) FROM books
                 WHERE deleted = 0 AND search_lang IS NOT NULL AND search_lang <> ''
                 GROUP BY search_lang
                 ORDER BY COUNT(*) DESC, MIN(lang)",
            )
            .map_err(SearchError::from_sqlite)?;
        let languages = stmt
            .query_map([], |row| {
                Ok(LanguageCount {
                    code: row.get(0)?,
                    books: row.get(1)?,
                })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(SearchError::from_sqlite)?;

        let mut stmt = conn
            .prepare(
                "SELECT g.meta, g.genre_code, g.description, COUNT(DISTINCT b.file_id)
                 FROM genres g
                 LEFT JOIN book_genres bg ON bg.genre_code = g.genre_code
                 LEFT JOIN books b ON b.file_id = bg.file_id AND b.deleted = 0
                 GROUP BY g.genre_code
                 ORDER BY g.meta, g.description",
            )
            .map_err(SearchError::from_sqlite)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    GenreEntry {
                        code: row.get(1)?,
                        description: row.get(2)?,
                        books: row.get(3)?,
                    },
                ))
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(SearchError::from_sqlite)?;

        let genres = rows
            .into_iter()
            .chunk_by(|(meta, _)| meta.clone())
            .into_iter()
            .map(|(meta, members)| GenreGroup {
                meta,
                genres: members.map(|(_, entry)| entry).collect(),
            })
            .collect::<Vec<_>>();

        tracing::info!(
            languages = languages.len(),
            genre_groups = genres.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "reference_data_loaded"
        );
        Ok(ReferenceData { languages, genres })
    }
}
