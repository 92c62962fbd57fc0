//! Cache store trait for persisted bars.
//!
//! This module defines the [`CacheStore`] trait, the only path through which
//! persisted bars are read or written.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::time::Duration;

use crate::{
    error::Result,
    interval::Interval,
    types::{Bar, CacheRecord, Instrument, Session},
};

/// How an upsert treats keys that are already persisted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WriteMode {
    /// Identical payloads are no-ops; a different payload rejects the batch.
    #[default]
    InsertOnly,
    /// Different payloads replace the stored bar and record new provenance.
    Overwrite,
}

/// Persistent store of bars keyed by `(instrument, interval, session)`.
///
/// Stores own their records exclusively. An acknowledged upsert is durable:
/// a following read of the same sessions observes the written values.
#[async_trait]
pub trait CacheStore: Send + Sync + Debug {
    /// Reads the bars present for `sessions`.
    ///
    /// Absent sessions are omitted from the map rather than reported as errors.
    async fn read_sessions(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<BTreeMap<Session, Bar>>;

    /// Returns which of `sessions` have a persisted bar.
    async fn present_sessions(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<BTreeSet<Session>> {
        Ok(self
            .read_sessions(instrument, interval, sessions)
            .await?
            .into_keys()
            .collect())
    }

    /// Reads every persisted bar whose session starts in `[start, end]`,
    /// ordered by session start.
    async fn read_range(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>>;

    /// Reads the full records (with cache provenance) for `sessions`.
    async fn read_records(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<Vec<CacheRecord>>;

    /// Writes bars and returns how many records were inserted or replaced.
    ///
    /// Writing a payload identical to the stored one is a no-op and is not
    /// counted. Under [`WriteMode::InsertOnly`] a differing payload rejects the
    /// whole batch with [`DataError::Conflict`](crate::DataError::Conflict).
    /// Bars failing [`Bar::validate`] are rejected with
    /// [`DataError::InvalidBar`](crate::DataError::InvalidBar).
    async fn upsert(&self, bars: &[Bar], mode: WriteMode) -> Result<usize>;

    /// Removes records cached longer ago than `ttl`.
    ///
    /// Returns the number of records removed.
    async fn invalidate_stale(&self, ttl: Duration) -> Result<usize>;

    /// Clears all records.
    async fn clear(&self) -> Result<()>;
}
