use catalog_search::config::EngineConfig;
use catalog_search::model::types::{Book, BookOrder, Facets, ResultKind, SizeBucket};
use catalog_search::search::normalize::normalize;
use catalog_search::search::predicate::compile;
use catalog_search::search::shaper::shape;
use catalog_search::search::{SearchEngine, SearchRequest};
use catalog_search::session::SessionKey;
use catalog_search::storage::sqlite::{
    AuthorRecord, CatalogRecord, CatalogStorage, GenreRecord, SeriesRecord,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use tempfile::TempDir;

// =============================================================================
// Query compilation
// =============================================================================

fn bench_normalize_words(c: &mut Criterion) {
    let query = "+толстой -детство (война мир) отроч* \"собачье сердце\"";
    c.bench_function("normalize_words", |b| {
        b.iter(|| black_box(normalize(black_box(query))))
    });
}

fn bench_normalize_criteria(c: &mut Criterion) {
    let query = "author:герберт | author:андерсон series:хроники year>=1965 lang:en";
    c.bench_function("normalize_criteria", |b| {
        b.iter(|| black_box(normalize(black_box(query))))
    });
}

fn bench_compile_with_facets(c: &mut Criterion) {
    let normalized = normalize("+фантастика -(ужасы мистика) звезд*");
    let facets = Facets {
        language: Some("ru".into()),
        size_bucket: Some(SizeBucket::Less800),
        ratings: [3, 4, 5].into_iter().collect(),
        ..Facets::default()
    };
    c.bench_function("compile_with_facets", |b| {
        b.iter(|| black_box(compile(black_box(&normalized), black_box(&facets))))
    });
}

// =============================================================================
// Result shaping
// =============================================================================

/// Rows as the join produces them: every book repeated per author and genre.
fn fanned_rows(books: usize) -> Vec<Book> {
    let mut rows = Vec::with_capacity(books * 6);
    for id in 0..books as i64 {
        for author in 0..2 {
            for genre in 0..3 {
                rows.push(Book {
                    file_id: id,
                    title: format!("Книга {id}"),
                    last_name: Some(format!("Автор{}", (id + author) % 50)),
                    first_name: Some("Имя".into()),
                    middle_name: None,
                    author_id: Some((id + author) % 50),
                    genre: Some(format!("Жанр {genre}")),
                    series_title: Some(format!("Серия {}", id % 40)),
                    series_id: Some(id % 40),
                    year: Some(1950 + id % 70),
                    language: Some("ru".into()),
                    size_bytes: 100_000 + id * 10,
                    rating: (id % 6) as u8,
                    relevance: (id % 13) as f64,
                });
            }
        }
    }
    rows
}

fn bench_shape_views(c: &mut Criterion) {
    let rows = fanned_rows(2000);
    let mut group = c.benchmark_group("shape_2000_books");
    for kind in [ResultKind::Books, ResultKind::Series, ResultKind::Authors] {
        group.bench_with_input(BenchmarkId::from_parameter(kind), &kind, |b, &kind| {
            b.iter(|| black_box(shape(rows.clone(), kind, BookOrder::Relevance)))
        });
    }
    group.finish();
}

// =============================================================================
// End-to-end search
// =============================================================================

fn build_catalog(count: i64) -> (TempDir, EngineConfig) {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("bench.db");
    let mut storage = CatalogStorage::open(&db_path).unwrap();
    let records = (0..count).map(|id| {
        Ok(CatalogRecord {
            file_id: id,
            title: format!("Звёздный путь {id}"),
            authors: vec![AuthorRecord {
                author_id: id % 300,
                last_name: format!("Автор{}", id % 300),
                first_name: "Имя".into(),
                ..Default::default()
            }],
            series: (id % 3 == 0).then(|| SeriesRecord {
                series_id: id % 200,
                title: format!("Серия {}", id % 200),
                number: None,
            }),
            genres: vec![GenreRecord {
                code: if id % 2 == 0 { "sf" } else { "prose" }.into(),
                description: if id % 2 == 0 {
                    "Научная фантастика"
                } else {
                    "Современная проза"
                }
                .into(),
                meta: "Разное".into(),
            }],
            year: Some(1950 + id % 70),
            lang: Some(if id % 4 == 0 { "en" } else { "ru" }.into()),
            size_bytes: (id % 1500) * 1024,
            ratings: vec![(id % 6) as u8],
            ..Default::default()
        })
    });
    storage.import_records(records, 1000).unwrap();

    let config = EngineConfig {
        db_path,
        settings_path: temp.path().join("settings.db"),
        ..EngineConfig::default()
    };
    (temp, config)
}

fn bench_search_20k(c: &mut Criterion) {
    let (_temp, config) = build_catalog(20_000);
    let engine = SearchEngine::new(&config);

    let mut group = c.benchmark_group("search_20k");
    for (name, query) in [
        ("word", "фантастика"),
        ("prefix", "звёзд*"),
        ("criteria", "author:автор12 year>=1990"),
    ] {
        let request = SearchRequest::new(query, Facets::default(), ResultKind::Books);
        group.bench_function(name, |b| {
            b.iter(|| black_box(engine.search(black_box(&request)).unwrap()))
        });
    }
    group.finish();
}

fn bench_page_from_cache(c: &mut Criterion) {
    let (_temp, config) = build_catalog(5_000);
    let engine = SearchEngine::new(&config);
    let key = SessionKey::user(1);
    let request = SearchRequest::new("фантастика", Facets::default(), ResultKind::Books);
    engine.search_into_session(key, &request, 20).unwrap();

    c.bench_function("get_page_cached", |b| {
        b.iter(|| black_box(engine.get_page(&key, ResultKind::Books, black_box(3)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_normalize_words,
    bench_normalize_criteria,
    bench_compile_with_facets,
    bench_shape_views,
    bench_search_20k,
    bench_page_from_cache,
);
criterion_main!(benches);
