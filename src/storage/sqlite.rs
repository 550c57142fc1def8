//! `SQLite` catalog: schema, pragmas, migrations and the import path.

use crate::model::types::{MAX_RATING, join_name_parts};
use crate::search::normalize::fold_search_text;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CURRENT_SCHEMA_VERSION: i64 = 3;

/// How long a statement waits on a locked catalog before failing busy.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS books (
    file_id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    search_title TEXT NOT NULL,
    year INTEGER,
    lang TEXT,
    search_lang TEXT,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS authors (
    author_id INTEGER PRIMARY KEY,
    last_name TEXT NOT NULL DEFAULT '',
    first_name TEXT NOT NULL DEFAULT '',
    middle_name TEXT NOT NULL DEFAULT '',
    search_author TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS book_authors (
    file_id INTEGER NOT NULL REFERENCES books(file_id) ON DELETE CASCADE,
    author_id INTEGER NOT NULL REFERENCES authors(author_id),
    PRIMARY KEY (file_id, author_id)
);

CREATE TABLE IF NOT EXISTS series (
    series_id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    search_series TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS book_series (
    file_id INTEGER NOT NULL REFERENCES books(file_id) ON DELETE CASCADE,
    series_id INTEGER NOT NULL REFERENCES series(series_id),
    series_no INTEGER,
    PRIMARY KEY (file_id, series_id)
);

CREATE TABLE IF NOT EXISTS genres (
    genre_code TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    meta TEXT NOT NULL DEFAULT '',
    search_genre TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS book_genres (
    file_id INTEGER NOT NULL REFERENCES books(file_id) ON DELETE CASCADE,
    genre_code TEXT NOT NULL REFERENCES genres(genre_code),
    PRIMARY KEY (file_id, genre_code)
);

CREATE TABLE IF NOT EXISTS ratings (
    file_id INTEGER NOT NULL REFERENCES books(file_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    rate INTEGER NOT NULL,
    PRIMARY KEY (file_id, seq)
);

CREATE TABLE IF NOT EXISTS book_search (
    file_id INTEGER PRIMARY KEY REFERENCES books(file_id) ON DELETE CASCADE,
    full_text TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_book_authors_author ON book_authors(author_id);
CREATE INDEX IF NOT EXISTS idx_book_series_series ON book_series(series_id);
CREATE INDEX IF NOT EXISTS idx_books_lang ON books(search_lang);
";

const MIGRATION_V2: &str = r"
CREATE TABLE IF NOT EXISTS book_annotations (
    file_id INTEGER PRIMARY KEY REFERENCES books(file_id) ON DELETE CASCADE,
    body TEXT NOT NULL,
    search_body TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS author_annotations (
    author_id INTEGER PRIMARY KEY REFERENCES authors(author_id),
    body TEXT NOT NULL,
    search_body TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_books USING fts5(
    body,
    tokenize='unicode61 remove_diacritics 2'
);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_book_annotations USING fts5(
    body,
    tokenize='unicode61 remove_diacritics 2'
);

CREATE VIRTUAL TABLE IF NOT EXISTS fts_author_annotations USING fts5(
    body,
    tokenize='unicode61 remove_diacritics 2'
);
";

const MIGRATION_V3: &str = r"
CREATE TABLE IF NOT EXISTS book_reviews (
    file_id INTEGER NOT NULL REFERENCES books(file_id) ON DELETE CASCADE,
    seq INTEGER NOT NULL,
    reviewer TEXT NOT NULL,
    time_ms INTEGER NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (file_id, seq)
);
";

/// One catalog entry as read from an import file (one JSON object per line).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CatalogRecord {
    pub file_id: i64,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<AuthorRecord>,
    #[serde(default)]
    pub series: Option<SeriesRecord>,
    #[serde(default)]
    pub genres: Vec<GenreRecord>,
    #[serde(default)]
    pub year: Option<i64>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub size_bytes: i64,
    /// Individual votes, 1..=5.
    #[serde(default)]
    pub ratings: Vec<u8>,
    #[serde(default)]
    pub annotation: Option<String>,
    #[serde(default)]
    pub reviews: Vec<ReviewRecord>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewRecord {
    pub reviewer: String,
    pub time: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorRecord {
    pub author_id: i64,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub middle_name: String,
    #[serde(default)]
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeriesRecord {
    pub series_id: i64,
    pub title: String,
    #[serde(default)]
    pub number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenreRecord {
    pub code: String,
    pub description: String,
    /// Parent group in the genre taxonomy.
    #[serde(default)]
    pub meta: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LibraryStats {
    pub books: i64,
    pub authors: i64,
    pub series: i64,
    pub genres: i64,
    pub languages: i64,
    pub last_import: Option<DateTime<Utc>>,
}

pub struct CatalogStorage {
    conn: Connection,
}

impl CatalogStorage {
    /// Open (creating if needed) a writable catalog and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating catalog directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening catalog at {}", path.display()))?;

        apply_pragmas(&mut conn)?;
        init_meta(&mut conn)?;
        migrate(&mut conn)?;

        Ok(Self { conn })
    }

    pub fn open_readonly(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening catalog readonly at {}", path.display()))?;

        apply_read_pragmas(&conn, DEFAULT_BUSY_TIMEOUT)?;

        Ok(Self { conn })
    }

    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    pub fn schema_version(&self) -> Result<i64> {
        read_schema_version(&self.conn)?.ok_or_else(|| anyhow!("schema_version missing"))
    }

    /// Insert or replace one record. FTS rows are written alongside.
    pub fn insert_book(&mut self, record: &CatalogRecord) -> Result<()> {
        let tx = self.conn.transaction()?;
        insert_record(&tx, record)?;
        tx.commit()?;
        Ok(())
    }

    /// Import records in batches of `batch_size` per transaction.
    ///
    /// Returns the number of records written.
    pub fn import_records<I>(&mut self, records: I, batch_size: usize) -> Result<usize>
    where
        I: IntoIterator<Item = Result<CatalogRecord>>,
    {
        let batch_size = batch_size.max(1);
        let mut written = 0usize;
        let mut tx = self.conn.transaction()?;
        for record in records {
            let record = record?;
            insert_record(&tx, &record)
                .with_context(|| format!("importing file_id {}", record.file_id))?;
            written += 1;
            if written % batch_size == 0 {
                tx.commit()?;
                info!(written, "catalog_import_progress");
                tx = self.conn.transaction()?;
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO meta(key, value) VALUES('last_import_ts', ?)",
            params![Utc::now().timestamp_millis().to_string()],
        )?;
        tx.commit()?;
        info!(written, "catalog_import_done");
        Ok(written)
    }

    /// Repopulate all three FTS tables from their source tables.
    pub fn rebuild_fts(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            r"DELETE FROM fts_books;
              DELETE FROM fts_book_annotations;
              DELETE FROM fts_author_annotations;
              INSERT INTO fts_books(rowid, body)
                  SELECT file_id, full_text FROM book_search;
              INSERT INTO fts_book_annotations(rowid, body)
                  SELECT file_id, search_body FROM book_annotations;
              INSERT INTO fts_author_annotations(rowid, body)
                  SELECT author_id, search_body FROM author_annotations;",
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };
        let last_import = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'last_import_ts'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(LibraryStats {
            books: count("SELECT COUNT(*) FROM books WHERE deleted = 0")?,
            authors: count("SELECT COUNT(*) FROM authors")?,
            series: count("SELECT COUNT(*) FROM series")?,
            genres: count("SELECT COUNT(*) FROM genres")?,
            languages: count(
                "SELECT COUNT(DISTINCT search_lang) FROM books
                 WHERE deleted = 0 AND search_lang IS NOT NULL AND search_lang <> ''",
            )?,
            last_import,
        })
    }
}

/// Space-padded search text for the primary source, so whole-word LIKE
/// patterns (`% WORD %`) also match at both ends.
fn primary_full_text(record: &CatalogRecord) -> String {
    let mut parts: Vec<String> = vec![record.title.clone()];
    parts.extend(record.authors.iter().map(|a| {
        join_name_parts(
            Some(&a.last_name),
            Some(&a.first_name),
            Some(&a.middle_name),
        )
    }));
    if let Some(series) = &record.series {
        parts.push(series.title.clone());
    }
    parts.extend(record.genres.iter().map(|g| g.description.clone()));
    if let Some(year) = record.year {
        parts.push(year.to_string());
    }
    if let Some(lang) = &record.lang {
        parts.push(lang.clone());
    }
    pad(&fold_search_text(&parts.join(" ")))
}

fn pad(folded: &str) -> String {
    format!(" {folded} ")
}

fn insert_record(tx: &Transaction<'_>, record: &CatalogRecord) -> Result<()> {
    let file_id = record.file_id;
    let lang = record
        .lang
        .as_deref()
        .map(str::trim)
        .filter(|l| !l.is_empty());

    tx.execute(
        "INSERT INTO books(file_id, title, search_title, year, lang, search_lang, size_bytes, deleted)
         VALUES(?,?,?,?,?,?,?,?)
         ON CONFLICT(file_id) DO UPDATE SET
             title=excluded.title, search_title=excluded.search_title, year=excluded.year,
             lang=excluded.lang, search_lang=excluded.search_lang,
             size_bytes=excluded.size_bytes, deleted=excluded.deleted",
        params![
            file_id,
            record.title,
            fold_search_text(&record.title),
            record.year,
            lang,
            lang.map(str::to_uppercase),
            record.size_bytes.max(0),
            record.deleted,
        ],
    )?;

    for table in ["book_authors", "book_series", "book_genres", "ratings", "book_reviews"] {
        tx.execute(&format!("DELETE FROM {table} WHERE file_id = ?"), params![file_id])?;
    }

    for author in &record.authors {
        let name = join_name_parts(
            Some(&author.last_name),
            Some(&author.first_name),
            Some(&author.middle_name),
        );
        tx.execute(
            "INSERT INTO authors(author_id, last_name, first_name, middle_name, search_author)
             VALUES(?,?,?,?,?)
             ON CONFLICT(author_id) DO UPDATE SET
                 last_name=excluded.last_name, first_name=excluded.first_name,
                 middle_name=excluded.middle_name, search_author=excluded.search_author",
            params![
                author.author_id,
                author.last_name.trim(),
                author.first_name.trim(),
                author.middle_name.trim(),
                fold_search_text(&name),
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO book_authors(file_id, author_id) VALUES(?,?)",
            params![file_id, author.author_id],
        )?;
        if let Some(body) = author.annotation.as_deref().filter(|b| !b.trim().is_empty()) {
            upsert_annotation(
                tx,
                "author_annotations",
                "author_id",
                "fts_author_annotations",
                author.author_id,
                body,
            )?;
        }
    }

    if let Some(series) = &record.series {
        tx.execute(
            "INSERT INTO series(series_id, title, search_series) VALUES(?,?,?)
             ON CONFLICT(series_id) DO UPDATE SET title=excluded.title, search_series=excluded.search_series",
            params![series.series_id, series.title, fold_search_text(&series.title)],
        )?;
        tx.execute(
            "INSERT INTO book_series(file_id, series_id, series_no) VALUES(?,?,?)",
            params![file_id, series.series_id, series.number],
        )?;
    }

    for genre in &record.genres {
        tx.execute(
            "INSERT INTO genres(genre_code, description, meta, search_genre) VALUES(?,?,?,?)
             ON CONFLICT(genre_code) DO UPDATE SET
                 description=excluded.description, meta=excluded.meta, search_genre=excluded.search_genre",
            params![
                genre.code,
                genre.description,
                genre.meta,
                fold_search_text(&genre.description)
            ],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO book_genres(file_id, genre_code) VALUES(?,?)",
            params![file_id, genre.code],
        )?;
    }

    for (seq, rate) in record.ratings.iter().enumerate() {
        tx.execute(
            "INSERT INTO ratings(file_id, seq, rate) VALUES(?,?,?)",
            params![file_id, seq as i64, (*rate).min(MAX_RATING)],
        )?;
    }

    for (seq, review) in record.reviews.iter().enumerate() {
        tx.execute(
            "INSERT INTO book_reviews(file_id, seq, reviewer, time_ms, body) VALUES(?,?,?,?,?)",
            params![
                file_id,
                seq as i64,
                review.reviewer,
                review.time.timestamp_millis(),
                review.text
            ],
        )?;
    }

    let full_text = primary_full_text(record);
    tx.execute(
        "INSERT OR REPLACE INTO book_search(file_id, full_text) VALUES(?,?)",
        params![file_id, full_text],
    )?;
    tx.execute("DELETE FROM fts_books WHERE rowid = ?", params![file_id])?;
    tx.execute(
        "INSERT INTO fts_books(rowid, body) VALUES(?,?)",
        params![file_id, full_text],
    )?;

    match record.annotation.as_deref().filter(|b| !b.trim().is_empty()) {
        Some(body) => upsert_annotation(
            tx,
            "book_annotations",
            "file_id",
            "fts_book_annotations",
            file_id,
            body,
        )?,
        None => {
            tx.execute("DELETE FROM book_annotations WHERE file_id = ?", params![file_id])?;
            tx.execute("DELETE FROM fts_book_annotations WHERE rowid = ?", params![file_id])?;
        }
    }

    Ok(())
}

fn upsert_annotation(
    tx: &Transaction<'_>,
    table: &str,
    key_column: &str,
    fts_table: &str,
    key: i64,
    body: &str,
) -> Result<()> {
    let search_body = pad(&fold_search_text(body));
    tx.execute(
        &format!("INSERT OR REPLACE INTO {table}({key_column}, body, search_body) VALUES(?,?,?)"),
        params![key, body, search_body],
    )?;
    tx.execute(&format!("DELETE FROM {fts_table} WHERE rowid = ?"), params![key])?;
    tx.execute(
        &format!("INSERT INTO {fts_table}(rowid, body) VALUES(?,?)"),
        params![key, search_body],
    )?;
    Ok(())
}

fn apply_pragmas(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 1000;
        PRAGMA foreign_keys = ON;
        ",
    )?;
    apply_read_pragmas(conn, DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Pragmas shared by writable and read-only connections.
pub(crate) fn apply_read_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        r"
        PRAGMA temp_store = MEMORY;
        PRAGMA cache_size = -65536; -- 64MB
        PRAGMA mmap_size = 268435456; -- 256MB
        ",
    )
}

fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
    )
    .optional()
}

fn init_meta(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    if read_schema_version(conn)?.is_none() {
        // Version 0 makes migrate() apply the full schema on first open.
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', 0)",
            [],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current = read_schema_version(conn)?.unwrap_or(0);

    if current == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    match current {
        0 => {
            tx.execute_batch(MIGRATION_V1)?;
            tx.execute_batch(MIGRATION_V2)?;
            tx.execute_batch(MIGRATION_V3)?;
        }
        1 => {
            tx.execute_batch(MIGRATION_V2)?;
            tx.execute_batch(MIGRATION_V3)?;
        }
        2 => {
            tx.execute_batch(MIGRATION_V3)?;
        }
        v => return Err(anyhow!("unsupported schema version {v}")),
    }

    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()?;
    info!(from = current, to = CURRENT_SCHEMA_VERSION, "catalog schema migrated");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(file_id: i64, title: &str) -> CatalogRecord {
        CatalogRecord {
            file_id,
            title: title.into(),
            authors: vec![AuthorRecord {
                author_id: 1,
                last_name: "Толстой".into(),
                first_name: "Лев".into(),
                middle_name: "Николаевич".into(),
                annotation: Some("Русский писатель".into()),
            }],
            series: None,
            genres: vec![GenreRecord {
                code: "prose_classic".into(),
                description: "Классическая проза".into(),
                meta: "Проза".into(),
            }],
            year: Some(1869),
            lang: Some("ru".into()),
            size_bytes: 1024,
            ratings: vec![4, 5],
            annotation: None,
            reviews: Vec::new(),
            deleted: false,
        }
    }

    #[test]
    fn open_applies_all_migrations() {
        let dir = TempDir::new().unwrap();
        let storage = CatalogStorage::open(&dir.path().join("c.db")).unwrap();
        assert_eq!(storage.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.db");
        CatalogStorage::open(&path).unwrap();
        let storage = CatalogStorage::open(&path).unwrap();
        assert_eq!(storage.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn insert_precomputes_search_columns() {
        let dir = TempDir::new().unwrap();
        let mut storage = CatalogStorage::open(&dir.path().join("c.db")).unwrap();
        storage.insert_book(&record(10, "Война и мир")).unwrap();

        let (search_title, search_lang): (String, String) = storage
            .raw()
            .query_row(
                "SELECT search_title, search_lang FROM books WHERE file_id = 10",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(search_title, "ВОЙНА И МИР");
        assert_eq!(search_lang, "RU");

        let full_text: String = storage
            .raw()
            .query_row("SELECT full_text FROM book_search WHERE file_id = 10", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert!(full_text.starts_with(" ВОЙНА И МИР ТОЛСТОЙ ЛЕВ НИКОЛАЕВИЧ"));
        assert!(full_text.ends_with(" 1869 RU "));
    }

    #[test]
    fn reinsert_replaces_links() {
        let dir = TempDir::new().unwrap();
        let mut storage = CatalogStorage::open(&dir.path().join("c.db")).unwrap();
        storage.insert_book(&record(10, "Война и мир")).unwrap();
        let mut updated = record(10, "Война и мир");
        updated.ratings = vec![3];
        storage.insert_book(&updated).unwrap();

        let votes: i64 = storage
            .raw()
            .query_row("SELECT COUNT(*) FROM ratings WHERE file_id = 10", [], |r| r.get(0))
            .unwrap();
        assert_eq!(votes, 1);
        let fts_rows: i64 = storage
            .raw()
            .query_row("SELECT COUNT(*) FROM fts_books", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fts_rows, 1);
    }

    #[test]
    fn import_and_stats() {
        let dir = TempDir::new().unwrap();
        let mut storage = CatalogStorage::open(&dir.path().join("c.db")).unwrap();
        let records = vec![Ok(record(1, "Детство")), Ok(record(2, "Отрочество"))];
        assert_eq!(storage.import_records(records, 1).unwrap(), 2);
        storage.rebuild_fts().unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.books, 2);
        assert_eq!(stats.authors, 1);
        assert_eq!(stats.genres, 1);
        assert_eq!(stats.languages, 1);
        assert!(stats.last_import.is_some());

        let annotated: i64 = storage
            .raw()
            .query_row("SELECT COUNT(*) FROM fts_author_annotations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(annotated, 1);
    }
}
