//! Turn raw joined rows into one of the three result views.

use crate::model::types::{
    AuthorAggregate, Book, BookOrder, ResultItems, ResultKind, SeriesAggregate,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

pub fn shape(rows: Vec<Book>, kind: ResultKind, order: BookOrder) -> ResultItems {
    match kind {
        ResultKind::Books => ResultItems::Books(books(rows, order)),
        ResultKind::Series => ResultItems::Series(series(&rows)),
        ResultKind::Authors => ResultItems::Authors(authors(&rows)),
    }
}

/// One entry per `file_id`. Columns that differ across a book's rows keep
/// their largest value; author and series fields move as a unit so a book
/// never shows one author's last name with another's first name.
pub fn books(rows: Vec<Book>, order: BookOrder) -> Vec<Book> {
    let mut by_id: HashMap<i64, Book> = HashMap::with_capacity(rows.len());
    for row in rows {
        match by_id.get_mut(&row.file_id) {
            Some(existing) => merge(existing, row),
            None => {
                by_id.insert(row.file_id, row);
            }
        }
    }

    let mut out: Vec<Book> = by_id.into_values().collect();
    out.sort_by(|a, b| compare_books(a, b, order));
    out
}

fn merge(into: &mut Book, row: Book) {
    if (&row.last_name, &row.first_name, &row.middle_name, row.author_id)
        > (&into.last_name, &into.first_name, &into.middle_name, into.author_id)
    {
        into.last_name = row.last_name;
        into.first_name = row.first_name;
        into.middle_name = row.middle_name;
        into.author_id = row.author_id;
    }
    if (&row.series_title, row.series_id) > (&into.series_title, into.series_id) {
        into.series_title = row.series_title;
        into.series_id = row.series_id;
    }
    if row.genre > into.genre {
        into.genre = row.genre;
    }
    if row.title > into.title {
        into.title = row.title;
    }
    into.year = into.year.max(row.year);
    into.language = into.language.take().max(row.language);
    into.size_bytes = into.size_bytes.max(row.size_bytes);
    into.rating = into.rating.max(row.rating);
    into.relevance = into.relevance.max(row.relevance);
}

fn compare_books(a: &Book, b: &Book, order: BookOrder) -> Ordering {
    let primary = match order {
        BookOrder::Relevance => b.relevance.total_cmp(&a.relevance),
        // None sorts below Some, so reversing puts undated books last.
        BookOrder::Newest => b.year.cmp(&a.year),
        BookOrder::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
    };
    primary.then(a.file_id.cmp(&b.file_id))
}

/// Books grouped by series; rows without a series are dropped.
pub fn series(rows: &[Book]) -> Vec<SeriesAggregate> {
    let mut groups: HashMap<(&str, i64), HashSet<i64>> = HashMap::new();
    for row in rows {
        if let (Some(title), Some(id)) = (row.series_title.as_deref(), row.series_id)
            && !title.trim().is_empty()
        {
            groups.entry((title, id)).or_default().insert(row.file_id);
        }
    }

    let mut out: Vec<SeriesAggregate> = groups
        .into_iter()
        .map(|((title, id), files)| SeriesAggregate {
            series_title: title.to_string(),
            series_id: id,
            book_count: files.len(),
        })
        .collect();
    out.sort_by(|a, b| {
        b.book_count
            .cmp(&a.book_count)
            .then_with(|| a.series_title.cmp(&b.series_title))
            .then(a.series_id.cmp(&b.series_id))
    });
    out
}

/// Books grouped by author; rows whose name parts are all empty are dropped.
pub fn authors(rows: &[Book]) -> Vec<AuthorAggregate> {
    let mut groups: HashMap<(String, i64), HashSet<i64>> = HashMap::new();
    for row in rows {
        let Some(id) = row.author_id else { continue };
        let name = row.author_name();
        if name.is_empty() {
            continue;
        }
        groups.entry((name, id)).or_default().insert(row.file_id);
    }

    let mut out: Vec<AuthorAggregate> = groups
        .into_iter()
        .map(|((name, id), files)| AuthorAggregate {
            author_name: name,
            author_id: id,
            book_count: files.len(),
        })
        .collect();
    out.sort_by(|a, b| {
        b.book_count
            .cmp(&a.book_count)
            .then_with(|| a.author_name.cmp(&b.author_name))
            .then(a.author_id.cmp(&b.author_id))
    });
    out
}
