//! Per-user search settings.
//!
//! Stored in a separate `SQLite` file from the catalog, which is opened
//! read-only by searches. Every setting is a named field; updates go through
//! [`SettingUpdate`], which rejects unknown keys instead of writing them.

use crate::model::types::{Facets, MAX_RATING, ResultKind, SearchArea, SizeBucket};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Page sizes a user may pick.
pub const PAGE_SIZES: [usize; 2] = [20, 40];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unknown setting '{0}'")]
    UnknownKey(String),
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("settings storage: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("creating settings directory {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Download format handed to the file collaborator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    #[default]
    Fb2,
    Mobi,
    Epub,
}

impl BookFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            BookFormat::Fb2 => "fb2",
            BookFormat::Mobi => "mobi",
            BookFormat::Epub => "epub",
        }
    }
}

impl FromStr for BookFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fb2" => Ok(BookFormat::Fb2),
            "mobi" => Ok(BookFormat::Mobi),
            "epub" => Ok(BookFormat::Epub),
            other => Err(format!("unknown format '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSettings {
    pub user_id: i64,
    pub page_size: usize,
    pub language: Option<String>,
    pub size_limit: Option<SizeBucket>,
    pub ratings: BTreeSet<u8>,
    pub view: ResultKind,
    pub search_area: SearchArea,
    pub book_format: BookFormat,
    pub blocked: bool,
    /// Unix millis.
    pub created_at: i64,
    pub updated_at: i64,
}

impl UserSettings {
    pub fn new(user_id: i64) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            user_id,
            page_size: PAGE_SIZES[0],
            language: None,
            size_limit: None,
            ratings: BTreeSet::new(),
            view: ResultKind::Books,
            search_area: SearchArea::Primary,
            book_format: BookFormat::Fb2,
            blocked: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Facets a search by this user starts from.
    pub fn facets(&self) -> Facets {
        Facets {
            language: self.language.clone(),
            size_bucket: self.size_limit,
            ratings: self.ratings.clone(),
            search_area: self.search_area,
            scope: None,
        }
    }

    pub fn apply(&mut self, update: SettingUpdate) {
        match update {
            SettingUpdate::PageSize(n) => self.page_size = n,
            SettingUpdate::Language(lang) => self.language = lang,
            SettingUpdate::SizeLimit(bucket) => self.size_limit = bucket,
            SettingUpdate::Ratings(set) => self.ratings = set,
            SettingUpdate::View(kind) => self.view = kind,
            SettingUpdate::SearchArea(area) => self.search_area = area,
            SettingUpdate::BookFormat(format) => self.book_format = format,
            SettingUpdate::Blocked(flag) => self.blocked = flag,
        }
        self.updated_at = Utc::now().timestamp_millis();
    }
}

/// One validated change to [`UserSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingUpdate {
    PageSize(usize),
    Language(Option<String>),
    SizeLimit(Option<SizeBucket>),
    Ratings(BTreeSet<u8>),
    View(ResultKind),
    SearchArea(SearchArea),
    BookFormat(BookFormat),
    Blocked(bool),
}

impl SettingUpdate {
    /// Recognized keys, for help output.
    pub const KEYS: [&'static str; 8] = [
        "page_size", "lang", "size", "rating", "view", "area", "format", "blocked",
    ];

    /// Parse a `key`/`value` pair. `none` or an empty value clears optional fields.
    pub fn parse(key: &str, value: &str) -> Result<Self, SettingsError> {
        let value = value.trim();
        let clear = value.is_empty() || value.eq_ignore_ascii_case("none");
        let invalid = |key: &'static str, reason: String| SettingsError::InvalidValue {
            key,
            value: value.to_string(),
            reason,
        };

        match key.trim().to_ascii_lowercase().as_str() {
            "page_size" | "max_books" => {
                let n: usize = value
                    .parse()
                    .map_err(|_| invalid("page_size", "not a number".into()))?;
                if PAGE_SIZES.contains(&n) {
                    Ok(SettingUpdate::PageSize(n))
                } else {
                    Err(invalid("page_size", format!("must be one of {PAGE_SIZES:?}")))
                }
            }
            "lang" | "language" => Ok(SettingUpdate::Language(
                (!clear).then(|| value.to_ascii_lowercase()),
            )),
            "size" | "size_limit" => {
                if clear {
                    Ok(SettingUpdate::SizeLimit(None))
                } else {
                    value
                        .parse()
                        .map(|b| SettingUpdate::SizeLimit(Some(b)))
                        .map_err(|e| invalid("size", e))
                }
            }
            "rating" | "ratings" => {
                if clear {
                    return Ok(SettingUpdate::Ratings(BTreeSet::new()));
                }
                let mut set = BTreeSet::new();
                for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let r: u8 = part
                        .parse()
                        .map_err(|_| invalid("rating", format!("'{part}' is not a number")))?;
                    if r > MAX_RATING {
                        return Err(invalid("rating", format!("{r} exceeds {MAX_RATING}")));
                    }
                    set.insert(r);
                }
                Ok(SettingUpdate::Ratings(set))
            }
            "view" => value
                .parse()
                .map(SettingUpdate::View)
                .map_err(|e| invalid("view", e)),
            "area" | "search_area" => value
                .parse()
                .map(SettingUpdate::SearchArea)
                .map_err(|e| invalid("area", e)),
            "format" | "book_format" => value
                .parse()
                .map(SettingUpdate::BookFormat)
                .map_err(|e| invalid("format", e)),
            "blocked" => match value.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(SettingUpdate::Blocked(true)),
                "false" | "no" | "0" | "off" => Ok(SettingUpdate::Blocked(false)),
                _ => Err(invalid("blocked", "expected true or false".into())),
            },
            other => Err(SettingsError::UnknownKey(other.to_string())),
        }
    }
}

impl fmt::Display for UserSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ratings = if self.ratings.is_empty() {
            "any".to_string()
        } else {
            self.ratings
                .iter()
                .map(u8::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        writeln!(f, "page_size = {}", self.page_size)?;
        writeln!(f, "lang      = {}", self.language.as_deref().unwrap_or("any"))?;
        writeln!(f, "size      = {}", self.size_limit.map_or("any", SizeBucket::as_str))?;
        writeln!(f, "rating    = {ratings}")?;
        writeln!(f, "view      = {}", self.view)?;
        writeln!(f, "area      = {}", self.search_area.as_str())?;
        writeln!(f, "format    = {}", self.book_format.as_str())?;
        write!(f, "blocked   = {}", self.blocked)
    }
}

pub struct SettingsStore {
    conn: Connection,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SettingsError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn })
    }

    pub fn get(&self, user_id: i64) -> Result<Option<UserSettings>, SettingsError> {
        Ok(self
            .conn
            .query_row(
                "SELECT user_id, page_size, lang, size_limit, ratings, view, area, book_format,
                        blocked, created_at, updated_at
                 FROM user_settings WHERE user_id = ?",
                params![user_id],
                row_to_settings,
            )
            .optional()?)
    }

    /// Settings for `user_id`, inserting defaults on first sight.
    pub fn get_or_create(&self, user_id: i64) -> Result<UserSettings, SettingsError> {
        if let Some(existing) = self.get(user_id)? {
            return Ok(existing);
        }
        let settings = UserSettings::new(user_id);
        self.save(&settings)?;
        tracing::debug!(user_id, "created default settings");
        Ok(settings)
    }

    pub fn apply(&self, user_id: i64, update: SettingUpdate) -> Result<UserSettings, SettingsError> {
        let mut settings = self.get_or_create(user_id)?;
        tracing::info!(user_id, update = ?update, "settings_update");
        settings.apply(update);
        self.save(&settings)?;
        Ok(settings)
    }

    fn save(&self, s: &UserSettings) -> Result<(), SettingsError> {
        let ratings = s
            .ratings
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.conn.execute(
            "INSERT INTO user_settings(user_id, page_size, lang, size_limit, ratings, view, area,
                                       book_format, blocked, created_at, updated_at)
             VALUES(?,?,?,?,?,?,?,?,?,?,?)
             ON CONFLICT(user_id) DO UPDATE SET
                 page_size=excluded.page_size, lang=excluded.lang, size_limit=excluded.size_limit,
                 ratings=excluded.ratings, view=excluded.view, area=excluded.area,
                 book_format=excluded.book_format, blocked=excluded.blocked,
                 updated_at=excluded.updated_at",
            params![
                s.user_id,
                s.page_size as i64,
                s.language,
                s.size_limit.map(SizeBucket::as_str),
                ratings,
                s.view.as_str(),
                s.search_area.as_str(),
                s.book_format.as_str(),
                s.blocked,
                s.created_at,
                s.updated_at,
            ],
        )?;
        Ok(())
    }
}

fn row_to_settings(row: &rusqlite::Row) -> rusqlite::Result<UserSettings> {
    // Stored values were validated on write; anything unreadable falls back
    // to the default for that field.
    let ratings: String = row.get(4)?;
    Ok(UserSettings {
        user_id: row.get(0)?,
        page_size: usize::try_from(row.get::<_, i64>(1)?).unwrap_or(PAGE_SIZES[0]),
        language: row.get(2)?,
        size_limit: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| s.parse().ok()),
        ratings: ratings
            .split(',')
            .filter_map(|r| r.trim().parse().ok())
            .collect(),
        view: row.get::<_, String>(5)?.parse().unwrap_or_default(),
        search_area: row.get::<_, String>(6)?.parse().unwrap_or_default(),
        book_format: row.get::<_, String>(7)?.parse().unwrap_or_default(),
        blocked: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS user_settings (
    user_id INTEGER PRIMARY KEY,
    page_size INTEGER NOT NULL DEFAULT 20,
    lang TEXT,
    size_limit TEXT,
    ratings TEXT NOT NULL DEFAULT '',
    view TEXT NOT NULL DEFAULT 'books',
    area TEXT NOT NULL DEFAULT 'primary',
    book_format TEXT NOT NULL DEFAULT 'fb2',
    blocked INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
";
