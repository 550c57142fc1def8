use catalog_search::config::EngineConfig;
use catalog_search::search::SearchEngine;
use catalog_search::storage::sqlite::{
    AuthorRecord, CatalogRecord, CatalogStorage, GenreRecord, SeriesRecord,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Builder for one catalog record.
#[derive(Debug, Clone)]
pub struct BookFixture(CatalogRecord);

#[allow(dead_code)]
impl BookFixture {
    pub fn new(file_id: i64, title: impl Into<String>) -> Self {
        Self(CatalogRecord {
            file_id,
            title: title.into(),
            lang: Some("ru".into()),
            size_bytes: 300 * 1024,
            ..Default::default()
        })
    }

    pub fn by(mut self, author_id: i64, last: &str, first: &str) -> Self {
        self.0.authors.push(AuthorRecord {
            author_id,
            last_name: last.into(),
            first_name: first.into(),
            ..Default::default()
        });
        self
    }

    pub fn author_note(mut self, text: &str) -> Self {
        if let Some(author) = self.0.authors.last_mut() {
            author.annotation = Some(text.into());
        }
        self
    }

    pub fn series(mut self, series_id: i64, title: &str) -> Self {
        self.0.series = Some(SeriesRecord {
            series_id,
            title: title.into(),
            number: None,
        });
        self
    }

    pub fn genre(mut self, code: &str, description: &str) -> Self {
        self.0.genres.push(GenreRecord {
            code: code.into(),
            description: description.into(),
            meta: "Разное".into(),
        });
        self
    }

    pub fn year(mut self, year: i64) -> Self {
        self.0.year = Some(year);
        self
    }

    pub fn lang(mut self, lang: &str) -> Self {
        self.0.lang = Some(lang.into());
        self
    }

    pub fn size_kib(mut self, kib: i64) -> Self {
        self.0.size_bytes = kib * 1024;
        self
    }

    pub fn ratings(mut self, votes: &[u8]) -> Self {
        self.0.ratings = votes.to_vec();
        self
    }

    pub fn annotation(mut self, text: &str) -> Self {
        self.0.annotation = Some(text.into());
        self
    }

    pub fn deleted(mut self) -> Self {
        self.0.deleted = true;
        self
    }

    pub fn build(self) -> CatalogRecord {
        self.0
    }
}

/// A catalog in a temp dir, plus config pointing at it.
#[allow(dead_code)]
pub struct CatalogFixture {
    pub dir: TempDir,
    pub db_path: PathBuf,
}

#[allow(dead_code)]
impl CatalogFixture {
    pub fn new(books: impl IntoIterator<Item = BookFixture>) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let db_path = dir.path().join("catalog.db");
        let mut storage = CatalogStorage::open(&db_path).expect("open catalog");
        storage
            .import_records(books.into_iter().map(|b| Ok(b.build())), 100)
            .expect("import fixture");
        Self { dir, db_path }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            db_path: self.db_path.clone(),
            settings_path: self.dir.path().join("settings.db"),
            pool_size: 2,
            checkout_timeout: Duration::from_secs(2),
            max_sessions: 64,
            ..EngineConfig::default()
        }
    }

    pub fn engine(&self) -> SearchEngine {
        SearchEngine::new(&self.config())
    }
}

/// The small literary catalog most scenario tests search.
#[allow(dead_code)]
pub fn classics() -> CatalogFixture {
    CatalogFixture::new([
        BookFixture::new(1, "Война и мир")
            .by(10, "Толстой", "Лев")
            .author_note("Русский писатель и мыслитель")
            .genre("prose_classic", "Классическая проза")
            .year(1869)
            .size_kib(2500)
            .ratings(&[5, 5, 4]),
        BookFixture::new(2, "Детство")
            .by(10, "Толстой", "Лев")
            .series(50, "Автобиографическая трилогия")
            .genre("prose_classic", "Классическая проза")
            .year(1852)
            .ratings(&[4]),
        BookFixture::new(3, "Отрочество")
            .by(10, "Толстой", "Лев")
            .series(50, "Автобиографическая трилогия")
            .genre("prose_classic", "Классическая проза")
            .year(1854),
        BookFixture::new(4, "Дюна")
            .by(20, "Герберт", "Фрэнк")
            .series(1234, "Хроники Дюны")
            .genre("sf", "Научная фантастика")
            .year(1965)
            .lang("en")
            .annotation("Пустынная планета Арракис и пряность")
            .ratings(&[5]),
        BookFixture::new(5, "Мессия Дюны")
            .by(20, "Герберт", "Фрэнк")
            .series(1234, "Хроники Дюны")
            .genre("sf", "Научная фантастика")
            .year(1969)
            .lang("en"),
        BookFixture::new(6, "Охотники за Дюной")
            .by(21, "Андерсон", "Кевин")
            .by(22, "Герберт", "Брайан")
            .series(1234, "Хроники Дюны")
            .genre("sf", "Научная фантастика")
            .year(2006)
            .lang("en"),
        BookFixture::new(9, "Глаза Гейзенберга")
            .by(20, "Герберт", "Фрэнк")
            .genre("sf", "Научная фантастика")
            .year(1966)
            .lang("en"),
        BookFixture::new(7, "Вишнёвый сад")
            .by(30, "Чехов", "Антон")
            .genre("dramaturgy", "Драматургия")
            .year(1904),
        BookFixture::new(8, "Удалённая книга")
            .by(30, "Чехов", "Антон")
            .deleted(),
    ])
}
