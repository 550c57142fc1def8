//! Engine configuration.
//!
//! Layered lowest to highest: built-in defaults, `config.toml` in the user
//! config directory (or an explicit path), `CATALOG_*` environment variables
//! (a `.env` file is honored), then CLI flags applied by the caller.

use crate::search::executor::DEFAULT_ROW_CAP;
use crate::storage::sqlite::DEFAULT_BUSY_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Page size used when neither settings nor flags pick one.
pub const DEFAULT_PAGE_SIZE: usize = 20;
/// Sessions idle this long are swept.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub settings_path: PathBuf,
    pub row_cap: usize,
    pub default_page_size: usize,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub pool_size: usize,
    pub checkout_timeout: Duration,
    /// How long a query waits on a locked catalog before it fails busy.
    pub busy_timeout: Duration,
    pub max_sessions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = crate::default_data_dir();
        Self {
            db_path: data_dir.join("catalog.db"),
            settings_path: data_dir.join("settings.db"),
            row_cap: DEFAULT_ROW_CAP,
            default_page_size: DEFAULT_PAGE_SIZE,
            session_ttl: DEFAULT_SESSION_TTL,
            sweep_interval: Duration::from_secs(300),
            pool_size: 4,
            checkout_timeout: Duration::from_secs(10),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            max_sessions: 10_000,
        }
    }
}

/// On-disk form; every field optional so a file only overrides what it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub db_path: Option<PathBuf>,
    pub settings_path: Option<PathBuf>,
    pub row_cap: Option<usize>,
    pub default_page_size: Option<usize>,
    pub session_ttl_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub pool_size: Option<usize>,
    pub checkout_timeout_ms: Option<u64>,
    pub busy_timeout_ms: Option<u64>,
    pub max_sessions: Option<usize>,
}

impl EngineConfig {
    /// Defaults, then `explicit` or the default config file, then environment.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| default_config_path().filter(|p| p.exists()));
        if let Some(path) = path {
            let file = read_config_file(&path)?;
            cfg.apply_file(&file);
            tracing::debug!(path = %path.display(), "loaded config file");
        }

        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_file(&mut self, file: &ConfigFile) {
        if let Some(p) = &file.db_path {
            self.db_path = p.clone();
        }
        if let Some(p) = &file.settings_path {
            self.settings_path = p.clone();
        }
        if let Some(n) = file.row_cap {
            self.row_cap = n;
        }
        if let Some(n) = file.default_page_size {
            self.default_page_size = n;
        }
        if let Some(s) = file.session_ttl_secs {
            self.session_ttl = Duration::from_secs(s);
        }
        if let Some(s) = file.sweep_interval_secs {
            self.sweep_interval = Duration::from_secs(s);
        }
        if let Some(n) = file.pool_size {
            self.pool_size = n;
        }
        if let Some(ms) = file.checkout_timeout_ms {
            self.checkout_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.busy_timeout_ms {
            self.busy_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = file.max_sessions {
            self.max_sessions = n;
        }
    }

    /// Override from `CATALOG_*` variables. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(path) = dotenvy::var("CATALOG_DB") {
            self.db_path = PathBuf::from(path);
        }

        if let Ok(path) = dotenvy::var("CATALOG_SETTINGS_DB") {
            self.settings_path = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("CATALOG_ROW_CAP")
            && let Ok(n) = val.parse()
        {
            self.row_cap = n;
        }

        if let Ok(val) = dotenvy::var("CATALOG_PAGE_SIZE")
            && let Ok(n) = val.parse()
        {
            self.default_page_size = n;
        }

        if let Ok(val) = dotenvy::var("CATALOG_SESSION_TTL_SECS")
            && let Ok(secs) = val.parse()
        {
            self.session_ttl = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("CATALOG_SWEEP_INTERVAL_SECS")
            && let Ok(secs) = val.parse()
        {
            self.sweep_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("CATALOG_POOL_SIZE")
            && let Ok(n) = val.parse()
        {
            self.pool_size = n;
        }

        if let Ok(val) = dotenvy::var("CATALOG_BUSY_TIMEOUT_MS")
            && let Ok(ms) = val.parse()
        {
            self.busy_timeout = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("CATALOG_MAX_SESSIONS")
            && let Ok(n) = val.parse()
        {
            self.max_sessions = n;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("row_cap", self.row_cap),
            ("default_page_size", self.default_page_size),
            ("pool_size", self.pool_size),
            ("max_sessions", self.max_sessions),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "sweep_interval_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "catalog-search", "catalog-search")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

fn read_config_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_only_named_fields() {
        let mut cfg = EngineConfig::default();
        let file: ConfigFile =
            toml::from_str("row_cap = 500\nsession_ttl_secs = 60\nbusy_timeout_ms = 250\n").unwrap();
        cfg.apply_file(&file);
        assert_eq!(cfg.row_cap, 500);
        assert_eq!(cfg.busy_timeout, Duration::from_millis(250));
        assert_eq!(cfg.session_ttl, Duration::from_secs(60));
        assert_eq!(cfg.default_page_size, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<ConfigFile>("rowcap = 1\n").is_err());
    }

    #[test]
    fn zero_sizes_fail_validation() {
        let cfg = EngineConfig {
            default_page_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
