//! Session-oriented fetching on top of a raw [`BarProvider`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use barsync_core::{
    Bar, BarFetcher, BarProvider, CalendarOracle, DataError, FetchBatch, GapSet, Instrument,
    Interval, RawBar, Result, RetryPolicy, Session, aggregate,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Rate-limit, timeout and batching settings of a [`RemoteFetcher`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Sliding window length, in milliseconds.
    pub window_ms: u64,
    /// Longest a request may wait for a slot, in milliseconds.
    pub max_wait_ms: u64,
    /// Deadline of a single provider attempt, in milliseconds.
    pub attempt_timeout_ms: u64,
    /// Largest number of sessions covered by one provider request.
    pub max_sessions_per_request: usize,
    /// Retry policy for retryable provider failures.
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window_ms: 60_000,
            max_wait_ms: 120_000,
            attempt_timeout_ms: 30_000,
            max_sessions_per_request: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl FetcherConfig {
    /// Checks that every bound is usable.
    ///
    /// # Errors
    /// Returns [`DataError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(DataError::Config("max_requests must be positive".into()));
        }
        if self.window_ms == 0 {
            return Err(DataError::Config("window_ms must be positive".into()));
        }
        if self.attempt_timeout_ms == 0 {
            return Err(DataError::Config("attempt_timeout_ms must be positive".into()));
        }
        if self.max_sessions_per_request == 0 {
            return Err(DataError::Config(
                "max_sessions_per_request must be positive".into(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(DataError::Config("retry.multiplier must be >= 1".into()));
        }
        Ok(())
    }
}

/// Sliding-window rate limiter.
///
/// Each admitted request reserves a slot; when `max_requests` slots are taken
/// within the last `window`, the caller sleeps until the oldest one expires.
/// A wait longer than `max_wait` fails instead of sleeping.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    max_wait: Duration,
    slots: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration, max_wait: Duration) -> Self {
        Self {
            max_requests: (max_requests as usize).max(1),
            window,
            max_wait,
            slots: Mutex::new(VecDeque::new()),
        }
    }

    /// Waits for a slot.
    ///
    /// # Errors
    /// Returns [`DataError::RateLimitExceeded`] if the next slot opens later
    /// than `max_wait` from now. No slot is consumed in that case.
    pub async fn acquire(&self) -> Result<()> {
        let now = Instant::now();
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            while slots
                .front()
                .is_some_and(|oldest| *oldest + self.window <= now)
            {
                slots.pop_front();
            }

            let slot = if slots.len() < self.max_requests {
                now
            } else {
                slots[slots.len() - self.max_requests] + self.window
            };
            let wait = slot.saturating_duration_since(now);
            if wait > self.max_wait {
                return Err(DataError::RateLimitExceeded { waited: wait });
            }
            slots.push_back(slot);
            slot
        };

        if slot > now {
            debug!(wait_ms = (slot - now).as_millis() as u64, "Rate limiting");
            tokio::time::sleep_until(slot).await;
        }
        Ok(())
    }
}

/// [`BarFetcher`] over a raw [`BarProvider`].
///
/// Splits the requested sessions into calendar-contiguous provider requests
/// of at most `max_sessions_per_request` sessions, admits each attempt
/// through the [`RateLimiter`], bounds it by `attempt_timeout` and retries
/// retryable failures, a refused rate-limit slot included, under the
/// [`RetryPolicy`]. Contiguity needs a calendar attached with
/// [`with_calendar`](Self::with_calendar). Returned bars are assigned to
/// requested sessions; anything else the provider sends is discarded.
#[derive(Debug)]
pub struct RemoteFetcher<P> {
    provider: P,
    calendar: Option<Arc<dyn CalendarOracle>>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    max_sessions_per_request: usize,
}

impl<P: BarProvider> RemoteFetcher<P> {
    /// Wraps `provider` with the given limits.
    #[must_use]
    pub fn new(provider: P, config: &FetcherConfig) -> Self {
        Self {
            provider,
            calendar: None,
            limiter: RateLimiter::new(
                config.max_requests,
                Duration::from_millis(config.window_ms),
                Duration::from_millis(config.max_wait_ms),
            ),
            retry: config.retry.clone(),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            max_sessions_per_request: config.max_sessions_per_request.max(1),
        }
    }

    /// Splits requests wherever `calendar` has a session between two
    /// requested ones.
    #[must_use]
    pub fn with_calendar(mut self, calendar: Arc<dyn CalendarOracle>) -> Self {
        self.calendar = Some(calendar);
        self
    }

    /// The wrapped provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Groups ordered `sessions` into runs with no calendar session between
    /// neighbours. Without a calendar, or when it cannot place every
    /// session, the whole request is one run.
    fn contiguous_runs(&self, interval: Interval, sessions: Vec<Session>) -> Vec<Vec<Session>> {
        let Some(calendar) = self.calendar.as_ref().filter(|_| !sessions.is_empty()) else {
            return vec![sessions];
        };
        let (first, last) = (&sessions[0], &sessions[sessions.len() - 1]);
        let Ok(expected) =
            calendar.sessions_in_range(&first.venue, interval, first.start, last.end)
        else {
            return vec![sessions];
        };

        let gaps = GapSet::select(&expected, |s| sessions.binary_search(s).is_ok());
        if gaps.len() != sessions.len() {
            return vec![sessions];
        }
        gaps.into_runs()
            .into_iter()
            .map(|run| run.into_sessions())
            .collect()
    }

    /// Fetches one chunk of sessions with rate limiting, timeout and retry.
    async fn fetch_chunk(
        &self,
        instrument: &Instrument,
        interval: Interval,
        chunk: &[Session],
    ) -> Result<Vec<RawBar>> {
        let (start, end) = request_window(interval, chunk)?;
        let provider = &self.provider;
        let limiter = &self.limiter;
        let timeout = self.attempt_timeout;

        let result = self
            .retry
            .run("fetch_bars", move |attempt| async move {
                limiter.acquire().await?;
                debug!(attempt, %start, %end, "Requesting bars");
                match tokio::time::timeout(
                    timeout,
                    provider.fetch_bars(instrument, interval, start, end),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(DataError::Timeout(timeout)),
                }
            })
            .await;

        result.map_err(|e| {
            if e.is_retryable() && !matches!(e, DataError::RateLimitExceeded { .. }) {
                DataError::transient(
                    provider.name(),
                    format!("gave up after {} attempts: {e}", self.retry.attempts()),
                )
            } else {
                e
            }
        })
    }
}

#[async_trait]
impl<P: BarProvider> BarFetcher for RemoteFetcher<P> {
    #[instrument(skip(self, sessions), fields(provider = self.provider.name(), instrument = %instrument, interval = %interval, sessions = sessions.len()))]
    async fn fetch(
        &self,
        instrument: &Instrument,
        interval: Interval,
        sessions: &[Session],
    ) -> Result<FetchBatch> {
        if !self.provider.supported_intervals().contains(&interval) {
            return Err(DataError::permanent(
                self.provider.name(),
                format!("interval {interval} is not supported"),
            ));
        }

        let mut requested = sessions.to_vec();
        requested.sort();
        requested.dedup();
        let total = requested.len();
        let raw_interval = self.provider.raw_interval(interval);

        let runs = self.contiguous_runs(interval, requested);
        let mut batch = FetchBatch::default();
        let mut chunks = runs
            .iter()
            .flat_map(|run| run.chunks(self.max_sessions_per_request));
        while let Some(chunk) = chunks.next() {
            match self.fetch_chunk(instrument, interval, chunk).await {
                Ok(raw) => {
                    let received = raw.len();
                    let bars = assign_sessions(
                        instrument,
                        interval,
                        raw_interval,
                        chunk,
                        raw,
                        Utc::now(),
                    );
                    debug!(received, kept = bars.len(), "Assigned bars to sessions");
                    batch.bars.extend(bars);
                }
                Err(e) => {
                    warn!(sessions = chunk.len(), error = %e, "Chunk fetch failed");
                    batch.failed.extend_from_slice(chunk);
                    let abort = !e.is_retryable();
                    batch.error = Some(e);
                    if abort {
                        // The remaining chunks would fail the same way.
                        for rest in chunks.by_ref() {
                            batch.failed.extend_from_slice(rest);
                        }
                    }
                }
            }
        }

        if total > 0 && batch.failed.len() == total {
            if let Some(error) = batch.error.take() {
                return Err(error);
            }
        }
        Ok(batch)
    }
}

/// Provider time range covering `chunk`.
///
/// Daily providers stamp bars at venue-local midnight, before the session
/// opens, so daily ranges start at UTC midnight of the first trading date.
fn request_window(
    interval: Interval,
    chunk: &[Session],
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
        return Err(DataError::InvalidParameter("empty session chunk".into()));
    };
    let start = if interval.is_intraday() {
        first.start
    } else {
        first
            .trading_date
            .and_hms_opt(0, 0, 0)
            .map_or(first.start, |midnight| midnight.and_utc().min(first.start))
    };
    Ok((start, last.end))
}

/// Binds raw bars to the requested sessions.
///
/// A daily bar matches by trading date. An intraday bar is accepted only if
/// it starts on a `raw_interval` boundary of the session containing it; the
/// accepted pieces of each session are combined into one bar. Off-grid bars
/// (an hour bucket stamped 10:00 against a 09:30 session) are discarded.
fn assign_sessions(
    instrument: &Instrument,
    interval: Interval,
    raw_interval: Interval,
    sessions: &[Session],
    raw: Vec<RawBar>,
    received_at: DateTime<Utc>,
) -> Vec<Bar> {
    if !interval.is_intraday() {
        return assign_daily(instrument, sessions, raw, received_at);
    }

    let step = raw_interval.duration().num_seconds().max(1);
    let mut parts: BTreeMap<&Session, BTreeMap<DateTime<Utc>, Bar>> = BTreeMap::new();
    let mut discarded = 0usize;
    for bar in raw {
        let Some(session) = containing_session(sessions, bar.timestamp) else {
            discarded += 1;
            continue;
        };
        if (bar.timestamp - session.start).num_seconds() % step != 0 {
            discarded += 1;
            continue;
        }
        let end = (bar.timestamp + raw_interval.duration()).min(session.end);
        let piece = match Session::new(
            session.venue.clone(),
            session.trading_date,
            bar.timestamp,
            end,
        ) {
            Ok(piece) => piece,
            Err(e) => {
                warn!(error = %e, "Dropping bar with unusable bounds");
                continue;
            }
        };
        let slot = parts.entry(session).or_default();
        if slot.contains_key(&bar.timestamp) {
            discarded += 1;
            continue;
        }
        slot.insert(
            bar.timestamp,
            Bar::from_raw(instrument.clone(), raw_interval, piece, &bar, received_at),
        );
    }

    if discarded > 0 {
        debug!(discarded, "Discarded bars off the requested session grid");
    }

    let mut assigned = Vec::with_capacity(parts.len());
    for (session, pieces) in parts {
        let pieces: Vec<Bar> = pieces.into_values().collect();
        let combined = match pieces.as_slice() {
            [only] if only.session.start == session.start && raw_interval == interval => {
                let mut bar = only.clone();
                bar.session = session.clone();
                Ok(bar)
            }
            _ => aggregate(&pieces, interval, session.clone()),
        };
        match combined.and_then(|bar| bar.validate().map(|()| bar)) {
            Ok(bar) => assigned.push(bar),
            Err(e) => warn!(session = %session, error = %e, "Dropping invalid bar"),
        }
    }
    assigned
}

fn assign_daily(
    instrument: &Instrument,
    sessions: &[Session],
    raw: Vec<RawBar>,
    received_at: DateTime<Utc>,
) -> Vec<Bar> {
    let by_date: HashMap<NaiveDate, &Session> =
        sessions.iter().map(|s| (s.trading_date, s)).collect();

    let mut assigned: BTreeMap<&Session, Bar> = BTreeMap::new();
    let mut discarded = 0usize;
    for bar in raw {
        let session = by_date
            .get(&bar.timestamp.date_naive())
            .copied()
            .or_else(|| containing_session(sessions, bar.timestamp));
        let Some(session) = session else {
            discarded += 1;
            continue;
        };
        if assigned.contains_key(session) {
            discarded += 1;
            continue;
        }

        let bound = Bar::from_raw(
            instrument.clone(),
            Interval::Daily,
            session.clone(),
            &bar,
            received_at,
        );
        match bound.validate() {
            Ok(()) => {
                assigned.insert(session, bound);
            }
            Err(e) => warn!(error = %e, "Dropping invalid bar"),
        }
    }

    if discarded > 0 {
        debug!(discarded, "Discarded bars outside the requested sessions");
    }
    assigned.into_values().collect()
}

fn containing_session(sessions: &[Session], ts: DateTime<Utc>) -> Option<&Session> {
    let idx = sessions.partition_point(|s| s.start <= ts);
    idx.checked_sub(1)
        .map(|i| &sessions[i])
        .filter(|s| s.contains(ts))
}
