//! In-memory store implementation.

use async_trait::async_trait;
use barsync_core::{
    Bar, BarKey, CacheRecord, CacheStore, DataError, Instrument, Interval, Result, Session,
    WriteMode,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Simple in-memory store for testing and development.
///
/// Records live in a `RwLock`-protected `HashMap` keyed by [`BarKey`] and are
/// lost when the store is dropped. Bars are cloned on every read and write.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<BarKey, CacheRecord>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn session_key(instrument: &Instrument, interval: Interval, session: &Session) -> BarKey {
    BarKey {
        instrument: instrument.clone(),
        interval,
        session_start: session.start,
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    #[instrument(skip(self, sessions), fields(instrument = %instrument, interval = %interval, sessions = sessions.len()))]
    async fn read_sessions(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<BTreeMap<Session, Bar>> {
        let records = self.records.read().await;
        let found: BTreeMap<Session, Bar> = sessions
            .iter()
            .filter_map(|session| {
                records
                    .get(&session_key(instrument, interval, session))
                    .map(|record| (session.clone(), record.bar.clone()))
            })
            .collect();
        debug!("Found {} of {} sessions", found.len(), sessions.len());
        Ok(found)
    }

    #[instrument(skip(self), fields(instrument = %instrument, interval = %interval))]
    async fn read_range(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let records = self.records.read().await;
        let mut bars: Vec<Bar> = records
            .iter()
            .filter(|(key, _)| {
                key.instrument == *instrument
                    && key.interval == interval
                    && key.session_start >= start
                    && key.session_start <= end
            })
            .map(|(_, record)| record.bar.clone())
            .collect();
        bars.sort_by_key(|bar| bar.session.start);
        Ok(bars)
    }

    async fn read_records(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<Vec<CacheRecord>> {
        let records = self.records.read().await;
        Ok(sessions
            .iter()
            .filter_map(|session| records.get(&session_key(instrument, interval, session)))
            .cloned()
            .collect())
    }

    #[instrument(skip(self, bars), fields(count = bars.len(), mode = ?mode))]
    async fn upsert(&self, bars: &[Bar], mode: WriteMode) -> Result<usize> {
        for bar in bars {
            bar.validate()?;
        }

        let now = Utc::now();
        let mut records = self.records.write().await;

        // Stage against the current map so a rejected batch leaves it untouched.
        let mut staged: HashMap<BarKey, CacheRecord> = HashMap::new();
        let mut conflicts = Vec::new();
        for bar in bars {
            let key = bar.key();
            let existing = staged.get(&key).or_else(|| records.get(&key));
            match existing {
                Some(record) if record.bar.same_payload(bar) => {}
                Some(record) => match mode {
                    WriteMode::InsertOnly => conflicts.push(key),
                    WriteMode::Overwrite => {
                        let revised = CacheRecord {
                            bar: bar.clone(),
                            cached_at: now,
                            revision: record.revision + 1,
                        };
                        staged.insert(key, revised);
                    }
                },
                None => {
                    staged.insert(key, CacheRecord::new(bar.clone(), now));
                }
            }
        }

        if !conflicts.is_empty() {
            debug!("Rejected batch with {} conflicting bars", conflicts.len());
            return Err(DataError::Conflict { keys: conflicts });
        }

        let written = staged.len();
        records.extend(staged);
        debug!("Stored {} bars", written);
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn invalidate_stale(&self, ttl: Duration) -> Result<usize> {
        let Some(cutoff) = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return Ok(0);
        };
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| record.cached_at > cutoff);
        let removed = before - records.len();
        if removed > 0 {
            debug!("Invalidated {} stale records", removed);
        }
        Ok(removed)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<()> {
        self.records.write().await.clear();
        debug!("Cleared all records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[tokio::test]
    async fn test_write_then_read() {
        conformance::write_then_read(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_read_range_is_ordered() {
        conformance::read_range_is_ordered(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_noop() {
        conformance::identical_rewrite_is_noop(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_conflict_rejects_batch() {
        conformance::conflict_rejects_batch(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_overwrite_bumps_revision() {
        conformance::overwrite_bumps_revision(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_invalid_bar_rejected() {
        conformance::invalid_bar_rejected(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_clear_and_invalidate() {
        conformance::clear_and_invalidate(&InMemoryStore::new()).await;
    }

    #[tokio::test]
    async fn test_len() {
        let store = InMemoryStore::new();
        assert!(store.is_empty().await);
        store
            .upsert(&[conformance::bar(2, 100.5)], WriteMode::InsertOnly)
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
    }
}
