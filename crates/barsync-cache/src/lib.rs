#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/barsync/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Store implementations of the [`CacheStore`] trait from `barsync-core`:
//!
//! - [`SqliteStore`] - Persistent SQLite-based store (default, requires `sqlite` feature)
//! - [`InMemoryStore`] - In-memory store for testing

/// In-memory store implementation.
pub mod memory;

/// SQLite-based store implementation.
#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the trait for convenience
pub use barsync_core::{CacheStore, WriteMode};

pub use memory::InMemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Behaviour every store must share, run against each implementation.
#[cfg(test)]
pub(crate) mod conformance {
    use barsync_core::{
        Bar, CacheStore, DataError, Instrument, Interval, Session, Venue, WriteMode,
    };
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

    pub(crate) fn session(day: u32) -> Session {
        Session::new(
            Venue::new("XNYS"),
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, day, 14, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, day, 21, 0, 0).unwrap(),
        )
        .unwrap()
    }

    pub(crate) fn provenance() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
    }

    pub(crate) fn bar(day: u32, close: f64) -> Bar {
        Bar {
            instrument: Instrument::new("ACME", "XNYS"),
            interval: Interval::Daily,
            session: session(day),
            open: 100.0,
            high: close.max(101.0),
            low: close.min(99.0),
            close,
            volume: 10_000.0,
            vwap: Some(100.2),
            transactions: Some(420),
            provenance: provenance(),
        }
    }

    fn acme() -> Instrument {
        Instrument::new("ACME", "XNYS")
    }

    pub(crate) async fn write_then_read(store: &dyn CacheStore) {
        let bars = vec![bar(2, 100.5), bar(3, 101.0), bar(4, 99.5)];
        assert_eq!(store.upsert(&bars, WriteMode::InsertOnly).await.unwrap(), 3);

        let sessions = [session(2), session(3), session(4), session(5)];
        let found = store
            .read_sessions(&acme(), Interval::Daily, &sessions)
            .await
            .unwrap();
        assert_eq!(found.len(), 3);
        assert!(!found.contains_key(&session(5)));
        assert_eq!(found[&session(3)].close, 101.0);
        assert!(found[&session(3)].same_payload(&bars[1]));

        let present = store
            .present_sessions(&acme(), Interval::Daily, &sessions)
            .await
            .unwrap();
        assert_eq!(present.len(), 3);

        // Other intervals and instruments are isolated.
        let other = store
            .read_sessions(&Instrument::new("ACME", "XNAS"), Interval::Daily, &sessions)
            .await
            .unwrap();
        assert!(other.is_empty());
        let hourly = store
            .read_sessions(&acme(), Interval::Hourly, &sessions)
            .await
            .unwrap();
        assert!(hourly.is_empty());
    }

    pub(crate) async fn read_range_is_ordered(store: &dyn CacheStore) {
        let bars = vec![bar(5, 1.0), bar(2, 2.0), bar(4, 3.0)];
        store.upsert(&bars, WriteMode::InsertOnly).await.unwrap();

        let range = store
            .read_range(
                &acme(),
                Interval::Daily,
                Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 4, 23, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        let days: Vec<NaiveDate> = range.iter().map(|b| b.session.trading_date).collect();
        assert_eq!(
            days,
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(),
            ]
        );
    }

    pub(crate) async fn identical_rewrite_is_noop(store: &dyn CacheStore) {
        let first = vec![bar(2, 100.5), bar(3, 101.0)];
        store.upsert(&first, WriteMode::InsertOnly).await.unwrap();

        let mut again = first.clone();
        again[0].provenance = provenance() + Duration::days(3);
        assert_eq!(store.upsert(&again, WriteMode::InsertOnly).await.unwrap(), 0);
        assert_eq!(store.upsert(&again, WriteMode::Overwrite).await.unwrap(), 0);

        let records = store
            .read_records(&acme(), Interval::Daily, &[session(2)])
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].revision, 1);
        assert_eq!(records[0].bar.provenance, provenance());
    }

    pub(crate) async fn conflict_rejects_batch(store: &dyn CacheStore) {
        store
            .upsert(&[bar(2, 100.5)], WriteMode::InsertOnly)
            .await
            .unwrap();

        let batch = vec![bar(2, 100.75), bar(3, 101.0)];
        let err = store
            .upsert(&batch, WriteMode::InsertOnly)
            .await
            .unwrap_err();
        match err {
            DataError::Conflict { keys } => {
                assert_eq!(keys, vec![bar(2, 100.75).key()]);
            }
            other => panic!("expected conflict, got {other}"),
        }

        // Nothing from the rejected batch was written.
        let found = store
            .read_sessions(&acme(), Interval::Daily, &[session(2), session(3)])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&session(2)].close, 100.5);
    }

    pub(crate) async fn overwrite_bumps_revision(store: &dyn CacheStore) {
        store
            .upsert(&[bar(2, 100.5)], WriteMode::InsertOnly)
            .await
            .unwrap();

        let mut revised = bar(2, 100.75);
        revised.provenance = provenance() + Duration::days(1);
        assert_eq!(
            store
                .upsert(std::slice::from_ref(&revised), WriteMode::Overwrite)
                .await
                .unwrap(),
            1
        );

        let records = store
            .read_records(&acme(), Interval::Daily, &[session(2)])
            .await
            .unwrap();
        assert_eq!(records[0].revision, 2);
        assert_eq!(records[0].bar.close, 100.75);
        assert_eq!(records[0].bar.provenance, revised.provenance);
    }

    pub(crate) async fn invalid_bar_rejected(store: &dyn CacheStore) {
        let mut broken = bar(2, 100.5);
        broken.high = 50.0;
        let result = store.upsert(&[bar(3, 1.0), broken], WriteMode::InsertOnly).await;
        assert!(matches!(result, Err(DataError::InvalidBar(_))));

        let found = store
            .read_sessions(&acme(), Interval::Daily, &[session(3)])
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    pub(crate) async fn clear_and_invalidate(store: &dyn CacheStore) {
        store
            .upsert(&[bar(2, 100.5), bar(3, 101.0)], WriteMode::InsertOnly)
            .await
            .unwrap();

        // Everything was cached just now.
        let removed = store
            .invalidate_stale(std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        let removed = store
            .invalidate_stale(std::time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(removed, 2);

        store
            .upsert(&[bar(4, 100.5)], WriteMode::InsertOnly)
            .await
            .unwrap();
        store.clear().await.unwrap();
        let found = store
            .read_sessions(&acme(), Interval::Daily, &[session(4)])
            .await
            .unwrap();
        assert!(found.is_empty());
    }
}
