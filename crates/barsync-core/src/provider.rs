//! Provider traits for fetching bars.
//!
//! - [`BarProvider`] - raw range requests against one market-data API
//! - [`BarFetcher`] - session-oriented fetching with partial-failure reporting

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

use crate::{
    error::{DataError, Result},
    interval::Interval,
    types::{Bar, Instrument, RawBar, Session},
};

/// A market-data API that serves OHLCV bars over a contiguous time range.
///
/// Implementations perform exactly one logical request per call and leave
/// rate limiting and retries to the caller. Errors must be classified with
/// [`DataError::is_retryable`] in mind: transport failures and throttling are
/// retryable, unknown instruments and authentication failures are not.
#[async_trait]
pub trait BarProvider: Send + Sync + Debug {
    /// Returns the name of this provider (e.g., "Polygon").
    fn name(&self) -> &str;

    /// Returns the intervals this provider can serve.
    fn supported_intervals(&self) -> &[Interval];

    /// Granularity of the raw bars [`fetch_bars`](Self::fetch_bars) returns
    /// for `interval`.
    ///
    /// A provider whose buckets are not aligned with the venue's sessions
    /// (hourly buckets on the hour for a venue opening at :30) answers with a
    /// finer interval that divides the session; the bars are then combined
    /// per session.
    fn raw_interval(&self, interval: Interval) -> Interval {
        interval
    }

    /// Fetches all bars with timestamps in `[start, end]`.
    ///
    /// An empty vector means the provider has no data for the range.
    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawBar>>;
}

/// Result of fetching a set of sessions.
///
/// Sessions that appear neither in `bars` nor in `failed` were answered by the
/// provider without data: they are legitimate holes, not failures.
#[derive(Debug, Default)]
pub struct FetchBatch {
    /// Bars for requested sessions, ordered by session start.
    pub bars: Vec<Bar>,
    /// Requested sessions whose request failed.
    pub failed: Vec<Session>,
    /// Last error behind `failed`, if any.
    pub error: Option<DataError>,
}

impl FetchBatch {
    /// Returns true if no requested session failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Fetches bars for specific sessions.
///
/// Only bars for requested sessions may be returned. A total failure is an
/// `Err`; a failure affecting some sessions is reported through
/// [`FetchBatch::failed`].
#[async_trait]
pub trait BarFetcher: Send + Sync + Debug {
    /// Fetches `sessions` (ordered, one venue) for an instrument and interval.
    async fn fetch(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<FetchBatch>;
}
