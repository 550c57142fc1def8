//! Per-book and per-author cards read straight from the catalog.

use crate::model::types::{MAX_RATING, join_name_parts};
use crate::search::error::SearchError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuthorRef {
    pub author_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Review {
    pub reviewer: String,
    pub time: Option<DateTime<Utc>>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BookDetails {
    pub file_id: i64,
    pub title: String,
    pub year: Option<i64>,
    pub language: Option<String>,
    pub size_bytes: i64,
    pub series_title: Option<String>,
    pub series_number: Option<i64>,
    /// Ordered by description.
    pub genres: Vec<String>,
    /// Ordered by name.
    pub authors: Vec<AuthorRef>,
    /// Rounded average, 0 when unrated.
    pub rating: u8,
    pub votes: i64,
    pub annotation: Option<String>,
    /// Newest first.
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuthorDetails {
    pub author_id: i64,
    pub name: String,
    pub annotation: Option<String>,
    /// Catalog books credited to the author, deleted ones excluded.
    pub books: i64,
}

/// Card for `file_id`, or `None` if there is no such live book.
pub fn book_details(conn: &Connection, file_id: i64) -> Result<Option<BookDetails>, SearchError> {
    let head = conn
        .prepare_cached(
            "SELECT b.file_id, b.title, b.year, b.lang, b.size_bytes,
                    s.title, bs.series_no,
                    (SELECT CAST(ROUND(AVG(rate)) AS INTEGER) FROM ratings r WHERE r.file_id = b.file_id),
                    (SELECT COUNT(*) FROM ratings r WHERE r.file_id = b.file_id),
                    ann.body
             FROM books b
             LEFT JOIN book_series bs ON bs.file_id = b.file_id
             LEFT JOIN series s ON s.series_id = bs.series_id
             LEFT JOIN book_annotations ann ON ann.file_id = b.file_id
             WHERE b.file_id = ? AND b.deleted = 0
             LIMIT 1",
        )
        .and_then(|mut stmt| {
            stmt.query_row(params![file_id], |row| {
                let rating: Option<i64> = row.get(7)?;
                Ok(BookDetails {
                    file_id: row.get(0)?,
                    title: row.get(1)?,
                    year: row.get(2)?,
                    language: row.get(3)?,
                    size_bytes: row.get(4)?,
                    series_title: row.get(5)?,
                    series_number: row.get(6)?,
                    genres: Vec::new(),
                    authors: Vec::new(),
                    rating: u8::try_from(rating.unwrap_or(0).clamp(0, i64::from(MAX_RATING)))
                        .unwrap_or(0),
                    votes: row.get(8)?,
                    annotation: row.get(9)?,
                    reviews: Vec::new(),
                })
            })
            .optional()
        })
        .map_err(SearchError::from_sqlite)?;

    let Some(mut details) = head else {
        return Ok(None);
    };

    details.genres = conn
        .prepare_cached(
            "SELECT g.description FROM book_genres bg
             JOIN genres g ON g.genre_code = bg.genre_code
             WHERE bg.file_id = ?
             ORDER BY g.description",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![file_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()
        })
        .map_err(SearchError::from_sqlite)?;

    details.authors = conn
        .prepare_cached(
            "SELECT a.author_id, a.last_name, a.first_name, a.middle_name
             FROM book_authors ba
             JOIN authors a ON a.author_id = ba.author_id
             WHERE ba.file_id = ?
             ORDER BY a.last_name, a.first_name, a.author_id",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![file_id], |row| {
                let (last, first, middle): (String, String, String) =
                    (row.get(1)?, row.get(2)?, row.get(3)?);
                Ok(AuthorRef {
                    author_id: row.get(0)?,
                    name: join_name_parts(Some(&last), Some(&first), Some(&middle)),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(SearchError::from_sqlite)?;

    details.reviews = conn
        .prepare_cached(
            "SELECT reviewer, time_ms, body FROM book_reviews
             WHERE file_id = ?
             ORDER BY time_ms DESC, seq ASC",
        )
        .and_then(|mut stmt| {
            stmt.query_map(params![file_id], |row| {
                let ms: i64 = row.get(1)?;
                Ok(Review {
                    reviewer: row.get(0)?,
                    time: Utc.timestamp_millis_opt(ms).single(),
                    text: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
        })
        .map_err(SearchError::from_sqlite)?;

    Ok(Some(details))
}

/// Card for `author_id`, or `None` if the author is unknown.
pub fn author_details(
    conn: &Connection,
    author_id: i64,
) -> Result<Option<AuthorDetails>, SearchError> {
    conn.prepare_cached(
        "SELECT a.author_id, a.last_name, a.first_name, a.middle_name, ann.body,
                (SELECT COUNT(DISTINCT b.file_id) FROM book_authors ba
                 JOIN books b ON b.file_id = ba.file_id AND b.deleted = 0
                 WHERE ba.author_id = a.author_id)
         FROM authors a
         LEFT JOIN author_annotations ann ON ann.author_id = a.author_id
         WHERE a.author_id = ?",
    )
    .and_then(|mut stmt| {
        stmt.query_row(params![author_id], |row| {
            let (last, first, middle): (String, String, String) =
                (row.get(1)?, row.get(2)?, row.get(3)?);
            Ok(AuthorDetails {
                author_id: row.get(0)?,
                name: join_name_parts(Some(&last), Some(&first), Some(&middle)),
                annotation: row.get(4)?,
                books: row.get(5)?,
            })
        })
        .optional()
    })
    .map_err(SearchError::from_sqlite)
}

impl fmt::Display for BookDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.file_id, self.title)?;
        if !self.authors.is_empty() {
            let names = self
                .authors
                .iter()
                .map(|a| format!("{} [{}]", a.name, a.author_id))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "authors: {names}")?;
        }
        if let Some(series) = &self.series_title {
            match self.series_number {
                Some(n) => writeln!(f, "series:  {series} #{n}")?,
                None => writeln!(f, "series:  {series}")?,
            }
        }
        if !self.genres.is_empty() {
            writeln!(f, "genres:  {}", self.genres.join(", "))?;
        }
        if let Some(year) = self.year {
            writeln!(f, "year:    {year}")?;
        }
        if let Some(lang) = &self.language {
            writeln!(f, "lang:    {lang}")?;
        }
        writeln!(f, "size:    {}KB", self.size_bytes / 1024)?;
        if self.votes > 0 {
            writeln!(f, "rating:  {} ({} votes)", self.rating, self.votes)?;
        }
        if let Some(text) = &self.annotation {
            writeln!(f, "\n{}", text.trim())?;
        }
        for review in &self.reviews {
            let when = review
                .time
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            writeln!(f, "\n{} {when}\n{}", review.reviewer, review.text.trim())?;
        }
        Ok(())
    }
}

impl fmt::Display for AuthorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {} ({} books)", self.author_id, self.name, self.books)?;
        if let Some(text) = &self.annotation {
            writeln!(f, "\n{}", text.trim())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite::{
        AuthorRecord, CatalogRecord, CatalogStorage, GenreRecord, ReviewRecord, SeriesRecord,
    };
    use tempfile::TempDir;

    fn genre(code: &str, description: &str) -> GenreRecord {
        GenreRecord {
            code: code.into(),
            description: description.into(),
            meta: "Фантастика".into(),
        }
    }

    fn catalog() -> (TempDir, CatalogStorage) {
        let dir = TempDir::new().unwrap();
        let mut storage = CatalogStorage::open(&dir.path().join("c.db")).unwrap();
        storage
            .insert_book(&CatalogRecord {
                file_id: 6,
                title: "Охотники за Дюной".into(),
                authors: vec![
                    AuthorRecord {
                        author_id: 22,
                        last_name: "Герберт".into(),
                        first_name: "Брайан".into(),
                        ..Default::default()
                    },
                    AuthorRecord {
                        author_id: 21,
                        last_name: "Андерсон".into(),
                        first_name: "Кевин".into(),
                        annotation: Some("Соавтор продолжений".into()),
                        ..Default::default()
                    },
                ],
                series: Some(SeriesRecord {
                    series_id: 1234,
                    title: "Хроники Дюны".into(),
                    number: Some(7),
                }),
                genres: vec![genre("sf", "Научная фантастика"), genre("epic", "Эпическая")],
                year: Some(2006),
                lang: Some("en".into()),
                size_bytes: 2048,
                ratings: vec![5, 4, 4],
                annotation: Some("Продолжение саги".into()),
                reviews: vec![
                    ReviewRecord {
                        reviewer: "анна".into(),
                        time: Utc.timestamp_millis_opt(1_000).unwrap(),
                        text: "Ранний отзыв".into(),
                    },
                    ReviewRecord {
                        reviewer: "борис".into(),
                        time: Utc.timestamp_millis_opt(9_000).unwrap(),
                        text: "Поздний отзыв".into(),
                    },
                ],
                deleted: false,
            })
            .unwrap();
        storage
            .insert_book(&CatalogRecord {
                file_id: 7,
                title: "Удалённая".into(),
                authors: vec![AuthorRecord {
                    author_id: 21,
                    last_name: "Андерсон".into(),
                    first_name: "Кевин".into(),
                    ..Default::default()
                }],
                deleted: true,
                ..Default::default()
            })
            .unwrap();
        (dir, storage)
    }

    #[test]
    fn book_card_joins_everything() {
        let (_dir, storage) = catalog();
        let card = book_details(storage.raw(), 6).unwrap().unwrap();
        assert_eq!(card.series_title.as_deref(), Some("Хроники Дюны"));
        assert_eq!(card.series_number, Some(7));
        assert_eq!(card.genres, vec!["Научная фантастика", "Эпическая"]);
        let names: Vec<&str> = card.authors.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["Андерсон Кевин", "Герберт Брайан"]);
        assert_eq!(card.rating, 4);
        assert_eq!(card.votes, 3);
        assert_eq!(card.annotation.as_deref(), Some("Продолжение саги"));
        assert_eq!(card.reviews[0].reviewer, "борис");
        assert_eq!(card.reviews.len(), 2);
    }

    #[test]
    fn deleted_and_unknown_books_have_no_card() {
        let (_dir, storage) = catalog();
        assert!(book_details(storage.raw(), 7).unwrap().is_none());
        assert!(book_details(storage.raw(), 999).unwrap().is_none());
    }

    #[test]
    fn author_card_counts_live_books() {
        let (_dir, storage) = catalog();
        let card = author_details(storage.raw(), 21).unwrap().unwrap();
        assert_eq!(card.name, "Андерсон Кевин");
        assert_eq!(card.books, 1);
        assert_eq!(card.annotation.as_deref(), Some("Соавтор продолжений"));

        let plain = author_details(storage.raw(), 22).unwrap().unwrap();
        assert!(plain.annotation.is_none());
        assert!(author_details(storage.raw(), 5).unwrap().is_none());
    }

    #[test]
    fn card_renders_series_number_and_reviews() {
        let (_dir, storage) = catalog();
        let text = book_details(storage.raw(), 6).unwrap().unwrap().to_string();
        assert!(text.contains("series:  Хроники Дюны #7"));
        assert!(text.contains("rating:  4 (3 votes)"));
        assert!(text.find("Поздний").unwrap() < text.find("Ранний").unwrap());
    }
}
