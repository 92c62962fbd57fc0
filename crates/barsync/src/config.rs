//! Engine configuration loaded from TOML.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use barsync_calendar::CalendarConfig;
use barsync_core::{DataError, Result, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fetcher::FetcherConfig;

/// Environment variable that overrides `polygon.api_key`.
pub const API_KEY_ENV: &str = "POLYGON_API_KEY";

/// Polygon.io credentials and endpoint.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolygonConfig {
    /// API key. Usually supplied through `POLYGON_API_KEY` instead.
    pub api_key: Option<String>,
    /// Alternative base URL.
    pub base_url: Option<String>,
}

impl fmt::Debug for PolygonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolygonConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Top-level configuration of a [`SyncEngine`](crate::SyncEngine).
///
/// Every section is optional; missing values take their defaults.
///
/// ```toml
/// cache_path = "bars.sqlite"
/// query_timeout_ms = 120000
///
/// [calendar]
/// venues = ["XNYS", "XNAS"]
/// first_year = 2010
/// last_year = 2030
///
/// [fetcher]
/// max_requests = 5
/// window_ms = 60000
///
/// [fetcher.retry]
/// max_attempts = 4
/// initial_backoff_ms = 250
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Venue calendars to load.
    pub calendar: CalendarConfig,
    /// Rate limit, retry and batching of provider requests.
    pub fetcher: FetcherConfig,
    /// Retry policy for store reads and writes.
    pub storage_retry: RetryPolicy,
    /// SQLite cache file. Without one, bars are kept in memory.
    pub cache_path: Option<PathBuf>,
    /// Default query deadline, in milliseconds.
    pub query_timeout_ms: Option<u64>,
    /// Polygon.io settings.
    pub polygon: PolygonConfig,
}

impl SyncConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    /// Returns [`DataError::Config`] if the text is not valid TOML for this schema.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| DataError::Config(format!("Invalid config: {e}")))
    }

    /// Reads a TOML file, applies environment overrides and validates the result.
    ///
    /// # Errors
    /// Returns [`DataError::Config`] if the file cannot be read, parsed or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            DataError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        config.validate()?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides from `lookup`, which maps variable names to values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|key| !key.trim().is_empty()) {
            self.polygon.api_key = Some(key);
        }
    }

    /// Default query deadline, if configured.
    #[must_use]
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// Checks the configuration for values no component can work with.
    ///
    /// # Errors
    /// Returns [`DataError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.fetcher.validate()?;
        if self.calendar.venues.is_empty() {
            return Err(DataError::Config("calendar.venues is empty".into()));
        }
        if self.calendar.first_year > self.calendar.last_year {
            return Err(DataError::Config(format!(
                "calendar.first_year {} is after last_year {}",
                self.calendar.first_year, self.calendar.last_year
            )));
        }
        if self.storage_retry.multiplier.is_nan() || self.storage_retry.multiplier < 1.0 {
            return Err(DataError::Config(
                "storage_retry.multiplier must be >= 1".into(),
            ));
        }
        if self.query_timeout_ms == Some(0) {
            return Err(DataError::Config("query_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(all(feature = "polygon", feature = "cache-sqlite"))]
mod assemble {
    use std::sync::Arc;

    use barsync_cache::{InMemoryStore, SqliteStore};
    use barsync_calendar::CalendarSet;
    use barsync_core::{CacheStore, CalendarOracle, DataError, Result};
    use barsync_polygon::PolygonProvider;
    use tracing::info;

    use super::SyncConfig;
    use crate::engine::SyncEngine;
    use crate::fetcher::RemoteFetcher;

    impl SyncEngine {
        /// Builds an engine with exchange calendars, a Polygon.io fetcher and
        /// a SQLite (or in-memory) store, as described by `config`.
        ///
        /// # Errors
        /// Returns [`DataError::Config`] for an invalid configuration or a
        /// missing API key, and the underlying error if a calendar or the
        /// store cannot be opened.
        pub fn from_config(config: &SyncConfig) -> Result<Self> {
            config.validate()?;

            let calendar = Arc::new(CalendarSet::from_config(&config.calendar)?);

            let api_key = config.polygon.api_key.clone().ok_or_else(|| {
                DataError::Config(format!(
                    "No Polygon API key: set polygon.api_key or {}",
                    super::API_KEY_ENV
                ))
            })?;
            let mut provider = PolygonProvider::new(api_key)?;
            if let Some(base_url) = &config.polygon.base_url {
                provider = provider.with_base_url(base_url.as_str());
            }
            let fetcher = Arc::new(
                RemoteFetcher::new(provider, &config.fetcher)
                    .with_calendar(Arc::clone(&calendar) as Arc<dyn CalendarOracle>),
            );

            let store: Arc<dyn CacheStore> = match &config.cache_path {
                Some(path) => Arc::new(SqliteStore::open(path)?),
                None => Arc::new(InMemoryStore::new()),
            };
            info!(
                venues = ?config.calendar.venues,
                persistent = config.cache_path.is_some(),
                "Assembled sync engine"
            );

            let mut engine = Self::new(calendar, store, fetcher)
                .with_storage_retry(config.storage_retry.clone());
            if let Some(timeout) = config.query_timeout() {
                engine = engine.with_default_timeout(timeout);
            }
            Ok(engine)
        }
    }
}
