//! SQLite-based store implementation.

use async_trait::async_trait;
use barsync_core::{
    Bar, CacheRecord, CacheStore, DataError, Instrument, Interval, Result, Session, Venue,
    WriteMode,
};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

const SELECT_COLUMNS: &str = "symbol, venue, interval, session_start, session_end, trading_date,
     open, high, low, close, volume, vwap, transactions, provenance, cached_at, revision";

/// SQLite-based store for market bars.
///
/// Bars are stored one row per `(symbol, interval, session_start, venue)` with
/// millisecond UTC timestamps, so the cache survives restarts. Every upsert
/// runs in one transaction. Queries run on `tokio::task::spawn_blocking`.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or schema creation fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(storage)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite store.
    ///
    /// Useful for testing; data is lost when the store is dropped.
    ///
    /// # Errors
    /// Returns an error if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                venue TEXT NOT NULL,
                interval TEXT NOT NULL,
                session_start INTEGER NOT NULL,
                session_end INTEGER NOT NULL,
                trading_date TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                vwap REAL,
                transactions INTEGER,
                provenance INTEGER NOT NULL,
                cached_at INTEGER NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                PRIMARY KEY (symbol, interval, session_start, venue)
            );
            CREATE INDEX IF NOT EXISTS idx_bars_cached_at ON bars(cached_at);",
        )
        .map_err(storage)?;

        debug!("SQLite store schema initialized");
        Ok(())
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| DataError::Storage(e.to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| DataError::Storage(format!("Store task failed: {e}")))?
    }
}

fn storage(e: rusqlite::Error) -> DataError {
    DataError::Storage(e.to_string())
}

/// A `bars` row as SQLite returns it.
struct StoredRow {
    symbol: String,
    venue: String,
    interval: String,
    session_start: i64,
    session_end: i64,
    trading_date: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    vwap: Option<f64>,
    transactions: Option<i64>,
    provenance: i64,
    cached_at: i64,
    revision: i64,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            symbol: row.get(0)?,
            venue: row.get(1)?,
            interval: row.get(2)?,
            session_start: row.get(3)?,
            session_end: row.get(4)?,
            trading_date: row.get(5)?,
            open: row.get(6)?,
            high: row.get(7)?,
            low: row.get(8)?,
            close: row.get(9)?,
            volume: row.get(10)?,
            vwap: row.get(11)?,
            transactions: row.get(12)?,
            provenance: row.get(13)?,
            cached_at: row.get(14)?,
            revision: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<CacheRecord> {
        let trading_date: NaiveDate = self
            .trading_date
            .parse()
            .map_err(|e| DataError::Parse(format!("Stored trading date: {e}")))?;
        let session = Session::new(
            Venue::new(self.venue.as_str()),
            trading_date,
            from_millis(self.session_start)?,
            from_millis(self.session_end)?,
        )?;
        let transactions = self
            .transactions
            .map(u64::try_from)
            .transpose()
            .map_err(|e| DataError::Parse(format!("Stored transactions: {e}")))?;
        let revision = u32::try_from(self.revision)
            .map_err(|e| DataError::Parse(format!("Stored revision: {e}")))?;

        let bar = Bar {
            instrument: Instrument::new(self.symbol.as_str(), self.venue.as_str()),
            interval: self.interval.parse()?,
            session,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            vwap: self.vwap,
            transactions,
            provenance: from_millis(self.provenance)?,
        };
        Ok(CacheRecord {
            bar,
            cached_at: from_millis(self.cached_at)?,
            revision,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DataError::Parse(format!("Stored timestamp out of range: {ms}")))
}

fn transactions_column(bar: &Bar) -> Result<Option<i64>> {
    bar.transactions
        .map(i64::try_from)
        .transpose()
        .map_err(|e| DataError::InvalidBar(format!("{}: transactions {e}", bar.key())))
}

/// Loads the records of `sessions`, keyed by session start.
fn select_sessions(
    conn: &Connection,
    instrument: &Instrument,
    interval: Interval,
    sessions: &[Session],
) -> Result<Vec<(Session, CacheRecord)>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {SELECT_COLUMNS} FROM bars
             WHERE symbol = ?1 AND venue = ?2 AND interval = ?3 AND session_start = ?4"
        ))
        .map_err(storage)?;

    let mut found = Vec::new();
    for session in sessions {
        let row = stmt
            .query_row(
                params![
                    instrument.symbol.as_str(),
                    instrument.venue.as_str(),
                    interval.code(),
                    session.start.timestamp_millis()
                ],
                StoredRow::from_row,
            )
            .optional()
            .map_err(storage)?;
        if let Some(row) = row {
            found.push((session.clone(), row.into_record()?));
        }
    }
    Ok(found)
}

fn find_record(tx: &Transaction<'_>, bar: &Bar) -> Result<Option<CacheRecord>> {
    tx.query_row(
        &format!(
            "SELECT {SELECT_COLUMNS} FROM bars
             WHERE symbol = ?1 AND venue = ?2 AND interval = ?3 AND session_start = ?4"
        ),
        params![
            bar.instrument.symbol.as_str(),
            bar.instrument.venue.as_str(),
            bar.interval.code(),
            bar.session.start.timestamp_millis()
        ],
        StoredRow::from_row,
    )
    .optional()
    .map_err(storage)?
    .map(StoredRow::into_record)
    .transpose()
}

fn write_bar(tx: &Transaction<'_>, bar: &Bar, cached_at: i64, revision: u32) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO bars
         (symbol, venue, interval, session_start, session_end, trading_date,
          open, high, low, close, volume, vwap, transactions, provenance, cached_at, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            bar.instrument.symbol.as_str(),
            bar.instrument.venue.as_str(),
            bar.interval.code(),
            bar.session.start.timestamp_millis(),
            bar.session.end.timestamp_millis(),
            bar.session.trading_date.to_string(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.vwap,
            transactions_column(bar)?,
            bar.provenance.timestamp_millis(),
            cached_at,
            revision
        ],
    )
    .map_err(storage)?;
    Ok(())
}

#[async_trait]
impl CacheStore for SqliteStore {
    #[instrument(skip(self, sessions), fields(instrument = %instrument, interval = %interval, sessions = sessions.len()))]
    async fn read_sessions(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<BTreeMap<Session, Bar>> {
        let instrument = instrument.clone();
        let sessions = sessions.to_vec();
        let found = self
            .with_conn(move |conn| select_sessions(conn, &instrument, interval, &sessions))
            .await?;

        debug!("Found {} cached bars", found.len());
        Ok(found
            .into_iter()
            .map(|(session, record)| (session, record.bar))
            .collect())
    }

    #[instrument(skip(self), fields(instrument = %instrument, interval = %interval))]
    async fn read_range(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Bar>> {
        let instrument = instrument.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM bars
                     WHERE symbol = ?1 AND venue = ?2 AND interval = ?3
                       AND session_start >= ?4 AND session_start <= ?5
                     ORDER BY session_start ASC"
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![
                        instrument.symbol.as_str(),
                        instrument.venue.as_str(),
                        interval.code(),
                        start.timestamp_millis(),
                        end.timestamp_millis()
                    ],
                    StoredRow::from_row,
                )
                .map_err(storage)?;

            let mut bars = Vec::new();
            for row in rows {
                bars.push(row.map_err(storage)?.into_record()?.bar);
            }
            Ok(bars)
        })
        .await
    }

    async fn read_records(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<Vec<CacheRecord>> {
        let instrument = instrument.clone();
        let sessions = sessions.to_vec();
        let found = self
            .with_conn(move |conn| select_sessions(conn, &instrument, interval, &sessions))
            .await?;
        Ok(found.into_iter().map(|(_, record)| record).collect())
    }

    #[instrument(skip(self, bars), fields(count = bars.len(), mode = ?mode))]
    async fn upsert(&self, bars: &[Bar], mode: WriteMode) -> Result<usize> {
        for bar in bars {
            bar.validate()?;
        }
        if bars.is_empty() {
            return Ok(0);
        }

        let bars = bars.to_vec();
        let written = self
            .with_conn(move |conn| {
                let cached_at = Utc::now().timestamp_millis();
                let tx = conn.transaction().map_err(storage)?;

                let mut conflicts = Vec::new();
                let mut written = 0usize;
                for bar in &bars {
                    match find_record(&tx, bar)? {
                        Some(record) if record.bar.same_payload(bar) => {}
                        Some(record) => match mode {
                            WriteMode::InsertOnly => conflicts.push(bar.key()),
                            WriteMode::Overwrite => {
                                write_bar(&tx, bar, cached_at, record.revision + 1)?;
                                written += 1;
                            }
                        },
                        None => {
                            write_bar(&tx, bar, cached_at, 1)?;
                            written += 1;
                        }
                    }
                }

                // Dropping the transaction rolls the batch back.
                if !conflicts.is_empty() {
                    return Err(DataError::Conflict { keys: conflicts });
                }
                tx.commit().map_err(storage)?;
                Ok(written)
            })
            .await?;

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
        let cutoff = cutoff.timestamp_millis();

        let deleted = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM bars WHERE cached_at <= ?1", params![cutoff])
                    .map_err(storage)
            })
            .await?;

        if deleted > 0 {
            debug!("Invalidated {} stale records", deleted);
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn clear(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute("DELETE FROM bars", []).map_err(storage))
            .await?;
        debug!("Cleared all records");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    fn store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_store_initialization() {
        assert!(SqliteStore::in_memory().is_ok());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        conformance::write_then_read(&store()).await;
    }

    #[tokio::test]
    async fn test_read_range_is_ordered() {
        conformance::read_range_is_ordered(&store()).await;
    }

    #[tokio::test]
    async fn test_identical_rewrite_is_noop() {
        conformance::identical_rewrite_is_noop(&store()).await;
    }

    #[tokio::test]
    async fn test_conflict_rejects_batch() {
        conformance::conflict_rejects_batch(&store()).await;
    }

    #[tokio::test]
    async fn test_overwrite_bumps_revision() {
        conformance::overwrite_bumps_revision(&store()).await;
    }

    #[tokio::test]
    async fn test_invalid_bar_rejected() {
        conformance::invalid_bar_rejected(&store()).await;
    }

    #[tokio::test]
    async fn test_clear_and_invalidate() {
        conformance::clear_and_invalidate(&store()).await;
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = std::env::temp_dir().join(format!("barsync-store-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bars.db");
        let _ = std::fs::remove_file(&path);

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .upsert(&[conformance::bar(2, 100.5)], WriteMode::InsertOnly)
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        let records = reopened
            .read_records(
                &Instrument::new("ACME", "XNYS"),
                Interval::Daily,
                &[conformance::session(2)],
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bar, conformance::bar(2, 100.5));

        drop(reopened);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
