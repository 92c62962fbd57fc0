#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/barsync/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Calendar-aware market bar synchronization.
//!
//! [`SyncEngine`] answers "give me the bars of this instrument between these
//! two instants" from a local [`CacheStore`], asking the provider only for the
//! trading sessions the cache lacks. The trading calendar decides which
//! sessions are expected, so weekends and holidays are never fetched and
//! never reported as missing.
//!
//! # Features
//!
//! - `polygon` - Polygon.io aggregates provider
//! - `cache-sqlite` - SQLite-backed store
//!
//! With both features enabled, [`SyncEngine::from_config`] assembles an
//! engine from a [`SyncConfig`].
//!
//! # Example
//!
//! ```rust,ignore
//! use barsync::{Instrument, Interval, SeriesOptions, SyncConfig, SyncEngine};
//! use chrono::{TimeZone, Utc};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::load("barsync.toml")?;
//!     let engine = SyncEngine::from_config(&config)?;
//!
//!     let acme = Instrument::new("ACME", "XNYS");
//!     let start = Utc.with_ymd_and_hms(2024, 1, 8, 0, 0, 0).unwrap();
//!     let end = Utc.with_ymd_and_hms(2024, 1, 12, 23, 59, 59).unwrap();
//!
//!     let series = engine
//!         .get_series(&acme, Interval::Daily, start, end, SeriesOptions::default())
//!         .await?;
//!     println!("{:?}", series.to_dataframe()?);
//!
//!     Ok(())
//! }
//! ```

// Core types and traits
pub use barsync_core::*;

// Calendars
pub use barsync_calendar::{CalendarConfig, CalendarSet, ExchangeCalendar, ExchangeCalendarBuilder};

// Stores
pub use barsync_cache::InMemoryStore;
#[cfg(feature = "cache-sqlite")]
pub use barsync_cache::SqliteStore;

// Providers
#[cfg(feature = "polygon")]
pub use barsync_polygon::PolygonProvider;

mod config;
mod engine;
mod fetcher;
mod flight;

pub use config::{API_KEY_ENV, PolygonConfig, SyncConfig};
pub use engine::{GapReason, MissingSession, SeriesOptions, SeriesResult, SyncEngine, SyncStats};
pub use fetcher::{FetcherConfig, RateLimiter, RemoteFetcher};
pub use flight::{FlightKey, FlightState};
