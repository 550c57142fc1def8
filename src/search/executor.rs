//! Run a compiled predicate against one of the catalog's full-text sources.
//!
//! Each source is a projection producing the same column set, so predicates
//! and row mapping never depend on which source was picked.

use crate::model::types::{Book, MAX_RATING, SIZE_BUCKET_THRESHOLD_BYTES, SearchArea};
use crate::search::error::SearchError;
use crate::search::predicate::{CompiledPredicate, SqlParam, count_placeholders};
use itertools::Itertools;
use rusqlite::{Connection, Row};
use std::time::Instant;

/// Rows kept per search before shaping.
pub const DEFAULT_ROW_CAP: usize = 2000;

struct Source {
    /// Join providing `src.full_text`.
    join: &'static str,
    fts_table: &'static str,
    /// Column the FTS rowid is keyed to.
    rank_key: &'static str,
}

fn source(area: SearchArea) -> Source {
    match area {
        SearchArea::Primary => Source {
            join: "JOIN book_search src ON src.file_id = b.file_id",
            fts_table: "fts_books",
            rank_key: "b.file_id",
        },
        SearchArea::BookAnnotations => Source {
            join: "JOIN (SELECT file_id, search_body AS full_text FROM book_annotations) src ON src.file_id = b.file_id",
            fts_table: "fts_book_annotations",
            rank_key: "b.file_id",
        },
        SearchArea::AuthorAnnotations => Source {
            join: "JOIN (SELECT author_id, search_body AS full_text FROM author_annotations) src ON src.author_id = a.author_id",
            fts_table: "fts_author_annotations",
            rank_key: "a.author_id",
        },
    }
}

/// Projection SQL for `area`. With `ranked`, the first placeholder is the
/// FTS5 MATCH expression.
fn projection(area: SearchArea, ranked: bool) -> String {
    let src = source(area);
    let (relevance, rank_join) = if ranked {
        (
            "-COALESCE(fts_rank.score, 0.0)".to_string(),
            format!(
                "LEFT JOIN (SELECT rowid AS doc_id, bm25({fts}) AS score FROM {fts} WHERE {fts} MATCH ?) fts_rank ON fts_rank.doc_id = {key}",
                fts = src.fts_table,
                key = src.rank_key,
            ),
        )
    } else {
        ("0.0".to_string(), String::new())
    };

    format!(
        "SELECT
            b.file_id AS file_id,
            b.title AS title,
            a.last_name AS last_name,
            a.first_name AS first_name,
            a.middle_name AS middle_name,
            a.author_id AS author_id,
            a.search_author AS search_author,
            s.series_id AS series_id,
            s.title AS series_title,
            s.search_series AS search_series,
            g.description AS genre,
            g.search_genre AS search_genre,
            b.year AS year,
            b.lang AS lang,
            b.search_lang AS search_lang,
            b.size_bytes AS size_bytes,
            CASE WHEN b.size_bytes <= {threshold} THEN 'less800' ELSE 'more800' END AS size_bucket,
            COALESCE(r.rating, 0) AS rating,
            b.search_title AS search_title,
            src.full_text AS full_text,
            {relevance} AS relevance
        FROM books b
        LEFT JOIN book_authors ba ON ba.file_id = b.file_id
        LEFT JOIN authors a ON a.author_id = ba.author_id
        LEFT JOIN book_series bs ON bs.file_id = b.file_id
        LEFT JOIN series s ON s.series_id = bs.series_id
        LEFT JOIN book_genres bg ON bg.file_id = b.file_id
        LEFT JOIN genres g ON g.genre_code = bg.genre_code
        LEFT JOIN (
            SELECT file_id, CAST(ROUND(AVG(rate)) AS INTEGER) AS rating
            FROM ratings GROUP BY file_id
        ) r ON r.file_id = b.file_id
        {join}
        {rank_join}
        WHERE b.deleted = 0",
        threshold = SIZE_BUCKET_THRESHOLD_BYTES,
        join = src.join,
    )
}

/// Full statement and its parameters for one search.
///
/// The cap applies to books, not joined rows: the best-ranked `row_cap`
/// file ids are picked first, then every matching row of those books is
/// returned so the shaper always merges a complete book.
pub fn build_statement(
    area: SearchArea,
    predicate: &CompiledPredicate,
    row_cap: usize,
) -> (String, Vec<SqlParam>) {
    let ranked = predicate.match_expr.is_some();
    let sql = format!(
        "WITH hits AS (
            SELECT file_id, title, last_name, first_name, middle_name, author_id, genre,
                   series_title, series_id, year, lang, size_bytes, rating, relevance
            FROM ({projection}) matched
            WHERE {predicate}
         ),
         capped AS (
            SELECT file_id FROM hits
            GROUP BY file_id
            ORDER BY MAX(relevance) DESC, file_id ASC
            LIMIT ?
         )
         SELECT hits.* FROM hits
         JOIN capped ON capped.file_id = hits.file_id
         ORDER BY hits.relevance DESC, hits.file_id ASC",
        projection = projection(area, ranked),
        predicate = predicate.sql,
    );

    let mut params = Vec::with_capacity(predicate.params.len() + 2);
    if let Some(expr) = &predicate.match_expr {
        params.push(SqlParam::Text(expr.clone()));
    }
    params.extend(predicate.params.iter().cloned());
    params.push(SqlParam::Integer(i64::try_from(row_cap).unwrap_or(i64::MAX)));
    (sql, params)
}

/// Execute `predicate` against the source for `area`, returning raw joined
/// rows (one per book × author × genre × series combination) for at most
/// `row_cap` distinct books.
pub fn execute(
    conn: &Connection,
    area: SearchArea,
    predicate: &CompiledPredicate,
    row_cap: usize,
) -> Result<Vec<Book>, SearchError> {
    if predicate.is_always_false() {
        tracing::debug!(area = area.as_str(), "always-false predicate; skipping backend");
        return Ok(Vec::new());
    }

    let (sql, params) = build_statement(area, predicate, row_cap);
    let placeholders = count_placeholders(&sql);
    if placeholders != params.len() {
        tracing::error!(placeholders, params = params.len(), sql = %sql, "placeholder mismatch");
        return Err(SearchError::Programming(format!(
            "statement has {placeholders} placeholders but {} parameters",
            params.len()
        )));
    }

    let start = Instant::now();
    let mut stmt = conn.prepare_cached(&sql).map_err(SearchError::from_sqlite)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), map_row)
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(SearchError::from_sqlite)?;

    let books = rows.iter().map(|b| b.file_id).unique().count();
    tracing::debug!(
        area = area.as_str(),
        rows = rows.len(),
        books,
        capped = books >= row_cap,
        elapsed_ms = start.elapsed().as_millis(),
        "search_rows"
    );
    Ok(rows)
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    let rating: i64 = row.get("rating")?;
    Ok(Book {
        file_id: row.get("file_id")?,
        title: row.get("title")?,
        last_name: row.get("last_name")?,
        first_name: row.get("first_name")?,
        middle_name: row.get("middle_name")?,
        author_id: row.get("author_id")?,
        genre: row.get("genre")?,
        series_title: row.get("series_title")?,
        series_id: row.get("series_id")?,
        year: row.get("year")?,
        language: row.get("lang")?,
        size_bytes: row.get("size_bytes")?,
        rating: u8::try_from(rating.clamp(0, i64::from(MAX_RATING))).unwrap_or(0),
        relevance: row.get("relevance")?,
    })
}
