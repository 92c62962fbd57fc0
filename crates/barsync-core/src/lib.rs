#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/barsync/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Core traits and types for market bar synchronization.
//!
//! This crate provides the foundational abstractions shared by the workspace:
//!
//! - [`CalendarOracle`](calendar::CalendarOracle) - Expected trading sessions per venue
//! - [`BarProvider`](provider::BarProvider) - Raw range requests against a data API
//! - [`BarFetcher`](provider::BarFetcher) - Session-oriented fetching with partial failures
//! - [`CacheStore`](cache::CacheStore) - Persistent, idempotent bar storage
//! - [`GapSet`](gap::GapSet) - Expected-but-missing sessions, split into runs
//! - [`RetryPolicy`](retry::RetryPolicy) - Injectable bounded backoff

/// Cache store trait and write modes.
pub mod cache;
/// Trading calendar trait.
pub mod calendar;
/// Error types for synchronization.
pub mod error;
/// DataFrame export.
pub mod frame;
/// Gap detection.
pub mod gap;
/// Bar interval definitions.
pub mod interval;
/// Provider and fetcher traits.
pub mod provider;
/// Retry policy.
pub mod retry;
/// Series fill and aggregation.
pub mod transform;
/// Core data types (Instrument, Session, Bar, ...).
pub mod types;

// Re-export commonly used items at crate root
pub use cache::{CacheStore, WriteMode};
pub use calendar::CalendarOracle;
pub use error::{DataError, Result, SyncError};
pub use frame::bars_to_dataframe;
pub use gap::{GapSet, SessionRun};
pub use interval::Interval;
pub use provider::{BarFetcher, BarProvider, FetchBatch};
pub use retry::RetryPolicy;
pub use transform::{FilledBar, aggregate, fill_missing};
pub use types::{Bar, BarKey, CacheRecord, Instrument, RawBar, Session, Symbol, Venue};
