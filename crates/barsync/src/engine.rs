//! Cache-first series queries.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use barsync_core::{
    Bar, BarFetcher, BarKey, CacheStore, CalendarOracle, DataError, FilledBar, GapSet, Instrument,
    Interval, RetryPolicy, Session, SyncError, WriteMode, bars_to_dataframe, fill_missing,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use polars::prelude::DataFrame;
use tracing::{debug, info, instrument, warn};

use crate::flight::{FlightKey, FlightOutcome, FlightRegistry, FlightState, FlightTicket};

/// Insert-only persists retried after dropping conflicting bars.
const MAX_CONFLICT_ROUNDS: usize = 3;

/// Per-query options of [`SyncEngine::get_series`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeriesOptions {
    /// Refetch every expected session and overwrite what is cached.
    pub refresh: bool,
    /// Deadline of the whole query. Falls back to the engine default.
    pub timeout: Option<Duration>,
}

impl SeriesOptions {
    /// Options that refetch and overwrite the range.
    #[must_use]
    pub const fn refresh() -> Self {
        Self {
            refresh: true,
            timeout: None,
        }
    }

    /// Sets the query deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Why an expected session has no fresh bar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GapReason {
    /// The provider answered without data for the session.
    ProviderAbsent,
    /// Fetching the session failed.
    FetchFailed(String),
    /// A refresh failed; the result carries the previously cached bar.
    RefreshFailed(String),
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderAbsent => f.write_str("no data from provider"),
            Self::FetchFailed(cause) => write!(f, "fetch failed: {cause}"),
            Self::RefreshFailed(cause) => write!(f, "refresh failed, cached bar kept: {cause}"),
        }
    }
}

/// An expected session missing from a [`SeriesResult`], or left stale by a
/// failed refresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingSession {
    /// The session without a bar.
    pub session: Session,
    /// Why it is missing.
    pub reason: GapReason,
}

/// Counters describing how a query was served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sessions the calendar expects in the range.
    pub expected: usize,
    /// Expected sessions already cached when the query started.
    pub cache_hits: usize,
    /// Sessions that had to be fetched.
    pub gaps: usize,
    /// Flights started by this query.
    pub flights_started: usize,
    /// In-flight fetches of other queries this query waited on.
    pub flights_joined: usize,
    /// Records written by the flights this query started.
    pub bars_written: usize,
}

/// Bars of one instrument over a range, with the sessions that are missing.
#[derive(Clone, Debug)]
pub struct SeriesResult {
    /// Requested instrument.
    pub instrument: Instrument,
    /// Requested interval.
    pub interval: Interval,
    /// Bars ordered by session start, at most one per expected session.
    pub bars: Vec<Bar>,
    /// Sessions the calendar expects in the range.
    pub expected: Vec<Session>,
    /// Expected sessions without a bar, plus the sessions a refresh could
    /// not update ([`GapReason::RefreshFailed`]).
    pub missing: Vec<MissingSession>,
    /// How the query was served.
    pub stats: SyncStats,
}

impl SeriesResult {
    /// Returns true if every expected session has an up-to-date bar.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Fraction of expected sessions not listed in `missing`; 1.0 for an
    /// empty range.
    #[must_use]
    pub fn completeness(&self) -> f64 {
        if self.expected.is_empty() {
            1.0
        } else {
            let served = self.expected.len().saturating_sub(self.missing.len());
            served as f64 / self.expected.len() as f64
        }
    }

    /// Sessions whose bar comes from the cache because a refresh failed.
    pub fn stale(&self) -> impl Iterator<Item = &Session> {
        self.missing
            .iter()
            .filter(|m| matches!(m.reason, GapReason::RefreshFailed(_)))
            .map(|m| &m.session)
    }

    /// Expected sessions with forward-filled placeholders for the missing ones.
    #[must_use]
    pub fn filled(&self) -> Vec<FilledBar> {
        fill_missing(&self.expected, &self.bars)
    }

    /// Converts the bars into a polars DataFrame.
    ///
    /// # Errors
    /// Returns an error if the DataFrame cannot be built.
    pub fn to_dataframe(&self) -> barsync_core::Result<DataFrame> {
        bars_to_dataframe(&self.bars)
    }
}

/// Stores, fetcher and retry policy shared by flight tasks.
#[derive(Clone)]
struct FlightContext {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn BarFetcher>,
    storage_retry: RetryPolicy,
}

impl FlightContext {
    async fn run(
        self,
        instrument: Instrument,
        interval: Interval,
        sessions: Vec<Session>,
        ticket: FlightTicket,
        mode: WriteMode,
    ) -> FlightOutcome {
        ticket.set_state(FlightState::Fetching);
        let sessions = if mode == WriteMode::InsertOnly {
            self.still_missing(&instrument, interval, sessions).await
        } else {
            sessions
        };
        let (bars, failed, error) = if sessions.is_empty() {
            (Vec::new(), Vec::new(), None)
        } else {
            match self.fetcher.fetch(&instrument, interval, &sessions).await {
                Ok(batch) => (batch.bars, batch.failed, batch.error),
                Err(e) => (Vec::new(), sessions.clone(), Some(e)),
            }
        };

        let mut written = 0;
        let mut storage_error = None;
        if !bars.is_empty() {
            match self.persist(&bars, mode).await {
                Ok(n) => written = n,
                Err(e) => {
                    warn!(%instrument, %interval, error = %e, "Failed to persist fetched bars");
                    storage_error = Some(e);
                }
            }
        }

        let all_failed = !sessions.is_empty() && failed.len() == sessions.len();
        let state = if storage_error.is_some() || all_failed {
            FlightState::Failed
        } else if failed.is_empty() {
            FlightState::Persisted
        } else {
            FlightState::PartiallyPersisted
        };
        debug!(
            %instrument,
            %interval,
            sessions = sessions.len(),
            fetched = bars.len(),
            failed = failed.len(),
            written,
            %state,
            "Flight finished"
        );
        ticket.set_state(state);
        // Keys are released only once the bars are durable.
        drop(ticket);

        FlightOutcome {
            state,
            failed,
            written,
            error,
            storage_error,
        }
    }

    /// Drops sessions persisted since the query read the store, by a flight
    /// that finished between that read and this flight's registration.
    async fn still_missing(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: Vec<Session>,
    ) -> Vec<Session> {
        match self
            .store
            .present_sessions(instrument, interval, &sessions)
            .await
        {
            Ok(present) if !present.is_empty() => {
                debug!(already_cached = present.len(), "Skipping sessions cached meanwhile");
                sessions
                    .into_iter()
                    .filter(|s| !present.contains(s))
                    .collect()
            }
            _ => sessions,
        }
    }

    /// Writes `bars`, dropping insert-only conflicts so the cached values stand.
    async fn persist(&self, bars: &[Bar], mode: WriteMode) -> barsync_core::Result<usize> {
        let mut pending = bars.to_vec();
        for _ in 0..MAX_CONFLICT_ROUNDS {
            let result = self
                .storage_retry
                .run("upsert", |_| self.store.upsert(&pending, mode))
                .await;
            match result {
                Err(DataError::Conflict { keys }) if mode == WriteMode::InsertOnly => {
                    debug!(conflicts = keys.len(), "Keeping cached bars over fetched ones");
                    let conflicting: HashSet<BarKey> = keys.into_iter().collect();
                    pending.retain(|bar| !conflicting.contains(&bar.key()));
                    if pending.is_empty() {
                        return Ok(0);
                    }
                }
                other => return other,
            }
        }
        Err(DataError::Storage(format!(
            "persist kept conflicting after {MAX_CONFLICT_ROUNDS} rounds"
        )))
    }
}

/// Serves bar series from the cache, fetching only the missing sessions.
///
/// Concurrent queries needing the same sessions share a single provider
/// fetch. Fetches run on their own tasks: a query that times out or is
/// dropped leaves them running, and their bars are persisted for the next
/// query.
///
/// # Example
///
/// ```rust,ignore
/// use barsync::{SyncEngine, SeriesOptions, Instrument, Interval};
///
/// let engine = SyncEngine::new(calendar, store, fetcher);
/// let acme = Instrument::new("ACME", "XNYS");
/// let series = engine
///     .get_series(&acme, Interval::Daily, start, end, SeriesOptions::default())
///     .await?;
/// println!("{} of {} sessions", series.bars.len(), series.expected.len());
/// ```
#[derive(Debug)]
pub struct SyncEngine {
    calendar: Arc<dyn CalendarOracle>,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn BarFetcher>,
    storage_retry: RetryPolicy,
    default_timeout: Option<Duration>,
    flights: Arc<FlightRegistry>,
}

impl SyncEngine {
    /// Creates an engine over a calendar, a store and a fetcher.
    #[must_use]
    pub fn new(
        calendar: Arc<dyn CalendarOracle>,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn BarFetcher>,
    ) -> Self {
        Self {
            calendar,
            store,
            fetcher,
            storage_retry: RetryPolicy::default(),
            default_timeout: None,
            flights: Arc::new(FlightRegistry::default()),
        }
    }

    /// Sets the retry policy for store reads and writes.
    #[must_use]
    pub fn with_storage_retry(mut self, policy: RetryPolicy) -> Self {
        self.storage_retry = policy;
        self
    }

    /// Sets the deadline used by queries that do not carry their own.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// The store this engine reads and writes.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// The calendar this engine expects sessions from.
    #[must_use]
    pub fn calendar(&self) -> &Arc<dyn CalendarOracle> {
        &self.calendar
    }

    /// Number of fetches currently in flight.
    #[must_use]
    pub fn inflight(&self) -> usize {
        self.flights.len()
    }

    /// State of the fetch currently covering `key`, if any.
    #[must_use]
    pub fn flight_state(&self, key: &FlightKey) -> Option<FlightState> {
        self.flights.state(key)
    }

    /// Returns the bars of `instrument` for every expected session in
    /// `[start, end]`, fetching the sessions the cache lacks.
    ///
    /// Sessions the provider has no data for, or whose fetch failed, are
    /// reported in [`SeriesResult::missing`].
    ///
    /// # Errors
    /// - [`SyncError::InvalidRequest`] if `start > end`
    /// - [`SyncError::Calendar`] if the expected sessions cannot be resolved
    /// - [`SyncError::Storage`] if the store keeps failing
    /// - [`SyncError::Fetch`] if every fetch failed and nothing in the range is cached
    /// - [`SyncError::Timeout`] if the deadline elapses first
    #[instrument(skip(self, options), fields(instrument = %instrument, interval = %interval, refresh = options.refresh))]
    pub async fn get_series(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: SeriesOptions,
    ) -> Result<SeriesResult, SyncError> {
        let query = self.query(instrument, interval, start, end, options.refresh);
        match options.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, query)
                .await
                .map_err(|_| SyncError::Timeout(limit))?,
            None => query.await,
        }
    }

    /// Runs independent [`get_series`](Self::get_series) queries concurrently.
    ///
    /// Results are returned in the order of `instruments`.
    pub async fn get_many(
        &self,
        instruments: &[Instrument],
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        options: SeriesOptions,
    ) -> Vec<Result<SeriesResult, SyncError>> {
        join_all(
            instruments
                .iter()
                .map(|instrument| self.get_series(instrument, interval, start, end, options)),
        )
        .await
    }

    /// Returns the expected sessions in `[start, end]` that are not cached,
    /// without fetching anything.
    ///
    /// # Errors
    /// Same as [`get_series`](Self::get_series), except that nothing is fetched.
    pub async fn detect_gaps(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<GapSet, SyncError> {
        let expected = self.expected_sessions(instrument, interval, start, end)?;
        let cached = self.read_cached(instrument, interval, &expected).await?;
        Ok(GapSet::select(&expected, |s| !cached.contains_key(s)))
    }

    fn expected_sessions(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>, SyncError> {
        if start > end {
            return Err(SyncError::InvalidRequest(format!(
                "start {start} is after end {end}"
            )));
        }
        self.calendar
            .sessions_in_range(&instrument.venue, interval, start, end)
            .map_err(SyncError::Calendar)
    }

    async fn read_cached(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<BTreeMap<Session, Bar>, SyncError> {
        if sessions.is_empty() {
            return Ok(BTreeMap::new());
        }
        self.storage_retry
            .run("read_sessions", |_| {
                self.store.read_sessions(instrument, interval, sessions)
            })
            .await
            .map_err(SyncError::Storage)
    }

    async fn query(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        refresh: bool,
    ) -> Result<SeriesResult, SyncError> {
        let expected = self.expected_sessions(instrument, interval, start, end)?;
        let cached = self.read_cached(instrument, interval, &expected).await?;

        let mut stats = SyncStats {
            expected: expected.len(),
            cache_hits: cached.len(),
            ..SyncStats::default()
        };
        let gaps = if refresh {
            GapSet::all(&expected)
        } else {
            GapSet::select(&expected, |s| !cached.contains_key(s))
        };
        stats.gaps = gaps.len();

        if gaps.is_empty() {
            debug!(sessions = expected.len(), "Served entirely from cache");
            return Ok(SeriesResult {
                instrument: instrument.clone(),
                interval,
                bars: cached.into_values().collect(),
                expected,
                missing: Vec::new(),
                stats,
            });
        }

        debug!(gaps = gaps.len(), runs = gaps.runs().len(), "Fetching gaps");
        let mode = if refresh {
            WriteMode::Overwrite
        } else {
            WriteMode::InsertOnly
        };
        let claim = self.flights.claim(instrument, interval, &gaps);
        let context = FlightContext {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            storage_retry: self.storage_retry.clone(),
        };
        for launch in claim.launches {
            let context = context.clone();
            let instrument = instrument.clone();
            launch.spawn(move |sessions, ticket| {
                context.run(instrument, interval, sessions, ticket, mode)
            });
        }
        stats.flights_started = claim.started.len();
        stats.flights_joined = claim.joined.len();

        let started = join_all(claim.started).await;
        let joined = join_all(claim.joined).await;
        stats.bars_written = started.iter().map(|o| o.written).sum();
        let outcomes: Vec<FlightOutcome> = started.into_iter().chain(joined).collect();

        if let Some(e) = outcomes.iter().find_map(|o| o.storage_error.clone()) {
            return Err(SyncError::Storage(e));
        }

        let mut failures: HashMap<Session, String> = HashMap::new();
        let mut last_error = None;
        for outcome in &outcomes {
            let cause = outcome
                .error
                .as_ref()
                .map_or_else(|| "fetch failed".to_string(), ToString::to_string);
            for session in &outcome.failed {
                failures.insert(session.clone(), cause.clone());
            }
            if outcome.error.is_some() {
                last_error.clone_from(&outcome.error);
            }
        }

        let bars: Vec<Bar> = self
            .read_cached(instrument, interval, &expected)
            .await?
            .into_values()
            .collect();
        let present: BTreeSet<&Session> = bars.iter().map(|bar| &bar.session).collect();
        let missing: Vec<MissingSession> = expected
            .iter()
            .filter_map(|session| {
                let cause = failures.get(session);
                let reason = match (present.contains(session), cause) {
                    (false, None) => GapReason::ProviderAbsent,
                    (false, Some(cause)) => GapReason::FetchFailed(cause.clone()),
                    // The cached bar was not replaced.
                    (true, Some(cause)) if refresh => GapReason::RefreshFailed(cause.clone()),
                    (true, _) => return None,
                };
                Some(MissingSession {
                    session: session.clone(),
                    reason,
                })
            })
            .collect();

        let all_failed = outcomes.iter().all(|o| o.state == FlightState::Failed);
        if all_failed && bars.is_empty() {
            let source = last_error
                .unwrap_or_else(|| DataError::Storage("fetch ended without a result".into()));
            warn!(missing = missing.len(), error = %source, "Every fetch failed");
            return Err(SyncError::Fetch {
                instrument: instrument.clone(),
                interval,
                missing: missing.into_iter().map(|m| m.session).collect(),
                source,
            });
        }

        let absent = missing
            .iter()
            .filter(|m| m.reason == GapReason::ProviderAbsent)
            .count();
        if absent > 0 {
            info!(absent, "Provider has no data for some expected sessions");
        }
        let failed = missing.len() - absent;
        if failed > 0 {
            warn!(failed, "Some sessions could not be fetched");
        }

        Ok(SeriesResult {
            instrument: instrument.clone(),
            interval,
            bars,
            expected,
            missing,
            stats,
        })
    }
}
