//! Registry of in-flight gap fetches.
//!
//! Every expected session being fetched is registered under a [`FlightKey`].
//! A caller that finds its gap already registered awaits the existing flight
//! instead of starting another provider request. Flights run on their own
//! tasks, so a caller dropping its future never cancels a fetch that others
//! wait on.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use barsync_core::{DataError, GapSet, Instrument, Interval, Session};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;
use tracing::trace;

/// Identity of one session being fetched.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlightKey {
    /// Instrument being fetched.
    pub instrument: Instrument,
    /// Bar granularity.
    pub interval: Interval,
    /// Start of the session.
    pub session_start: DateTime<Utc>,
}

impl FlightKey {
    /// Key of `session` for an instrument and interval.
    #[must_use]
    pub fn new(instrument: &Instrument, interval: Interval, session: &Session) -> Self {
        Self {
            instrument: instrument.clone(),
            interval,
            session_start: session.start,
        }
    }
}

/// Lifecycle of one gap fetch.
///
/// `Pending -> Fetching -> {Persisted, PartiallyPersisted, Failed}`. Only
/// registered flights (`Pending` or `Fetching`) can be joined; a failed
/// flight is retried by the next query that finds the sessions missing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlightState {
    /// Registered, task not yet running.
    Pending,
    /// Provider request in progress.
    Fetching,
    /// Every requested session was answered and the bars were stored.
    Persisted,
    /// Some sessions failed; the bars that arrived were stored.
    PartiallyPersisted,
    /// Nothing could be fetched or stored.
    Failed,
}

impl FlightState {
    /// Returns true for the terminal states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Persisted | Self::PartiallyPersisted | Self::Failed
        )
    }
}

impl fmt::Display for FlightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Persisted => "persisted",
            Self::PartiallyPersisted => "partially persisted",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a finished flight, shared by every caller awaiting it.
#[derive(Clone, Debug)]
pub(crate) struct FlightOutcome {
    pub(crate) state: FlightState,
    /// Sessions whose fetch failed.
    pub(crate) failed: Vec<Session>,
    /// Records written by this flight.
    pub(crate) written: usize,
    /// Last fetch error behind `failed`.
    pub(crate) error: Option<DataError>,
    /// Storage error that prevented persisting fetched bars.
    pub(crate) storage_error: Option<DataError>,
}

impl FlightOutcome {
    fn aborted(sessions: Vec<Session>) -> Self {
        Self {
            state: FlightState::Failed,
            failed: sessions,
            written: 0,
            error: Some(DataError::transient(
                "flight",
                "fetch task ended without an outcome",
            )),
            storage_error: None,
        }
    }
}

pub(crate) type FlightHandle = Shared<BoxFuture<'static, FlightOutcome>>;

#[derive(Clone)]
struct Entry {
    id: u64,
    state: Arc<Mutex<FlightState>>,
    handle: FlightHandle,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<FlightKey, Entry>,
}

/// Map from [`FlightKey`] to the flight fetching it.
#[derive(Default)]
pub(crate) struct FlightRegistry {
    inner: Mutex<Inner>,
}

impl fmt::Debug for FlightRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightRegistry")
            .field("flights", &self.len())
            .finish()
    }
}

/// Flights a query started and joined.
#[derive(Default)]
pub(crate) struct Claim {
    pub(crate) started: Vec<FlightHandle>,
    pub(crate) joined: Vec<FlightHandle>,
    pub(crate) launches: Vec<Launch>,
}

/// A registered flight whose task has not been spawned yet.
pub(crate) struct Launch {
    sessions: Vec<Session>,
    ticket: FlightTicket,
    tx: oneshot::Sender<FlightOutcome>,
}

impl Launch {
    /// Spawns the flight task. `run` receives the ticket and must keep it
    /// until it has persisted its result; dropping it releases the keys.
    pub(crate) fn spawn<F, Fut>(self, run: F)
    where
        F: FnOnce(Vec<Session>, FlightTicket) -> Fut,
        Fut: Future<Output = FlightOutcome> + Send + 'static,
    {
        let Self {
            sessions,
            ticket,
            tx,
        } = self;
        let flight = run(sessions, ticket);
        tokio::spawn(async move {
            let outcome = flight.await;
            let _ = tx.send(outcome);
        });
    }
}

/// Ownership of the registered keys of one flight.
///
/// Dropping the ticket removes the keys from the registry.
pub(crate) struct FlightTicket {
    registry: Arc<FlightRegistry>,
    id: u64,
    keys: Vec<FlightKey>,
    state: Arc<Mutex<FlightState>>,
}

impl FlightTicket {
    pub(crate) fn set_state(&self, state: FlightState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl Drop for FlightTicket {
    fn drop(&mut self) {
        self.registry.release(self.id, &self.keys);
    }
}

impl FlightRegistry {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of flights currently registered.
    pub(crate) fn len(&self) -> usize {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.id)
            .collect::<HashSet<_>>()
            .len()
    }

    /// State of the flight fetching `key`, if one is registered.
    pub(crate) fn state(&self, key: &FlightKey) -> Option<FlightState> {
        let entry = self.lock().entries.get(key).cloned()?;
        let state = *entry.state.lock().unwrap_or_else(PoisonError::into_inner);
        Some(state)
    }

    /// Claims the sessions of `gaps`.
    ///
    /// Sessions already registered join the existing flight. Each maximal
    /// stretch of unregistered sessions inside a run becomes a new flight,
    /// registered before this returns; its task is spawned by the caller
    /// through [`Claim::launches`].
    pub(crate) fn claim(
        self: &Arc<Self>,
        instrument: &Instrument,
        interval: Interval,
        gaps: &GapSet,
    ) -> Claim {
        let mut inner = self.lock();
        let mut claim = Claim::default();
        let mut joined_ids = HashSet::new();

        for run in gaps.runs() {
            let mut unclaimed: Vec<Session> = Vec::new();
            for session in run.sessions() {
                let key = FlightKey::new(instrument, interval, session);
                let existing = inner
                    .entries
                    .get(&key)
                    .map(|entry| (entry.id, entry.handle.clone()));
                match existing {
                    Some((id, handle)) => {
                        if joined_ids.insert(id) {
                            trace!(flight = id, "Joining in-flight fetch");
                            claim.joined.push(handle);
                        }
                        let stretch = std::mem::take(&mut unclaimed);
                        self.register(&mut inner, instrument, interval, stretch, &mut claim);
                    }
                    None => unclaimed.push(session.clone()),
                }
            }
            self.register(&mut inner, instrument, interval, unclaimed, &mut claim);
        }
        claim
    }

    fn register(
        self: &Arc<Self>,
        inner: &mut Inner,
        instrument: &Instrument,
        interval: Interval,
        sessions: Vec<Session>,
        claim: &mut Claim,
    ) {
        if sessions.is_empty() {
            return;
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let keys: Vec<FlightKey> = sessions
            .iter()
            .map(|session| FlightKey::new(instrument, interval, session))
            .collect();
        let state = Arc::new(Mutex::new(FlightState::Pending));
        let (tx, rx) = oneshot::channel();
        let fallback = sessions.clone();
        let handle: FlightHandle = async move {
            rx.await
                .unwrap_or_else(|_| FlightOutcome::aborted(fallback))
        }
        .boxed()
        .shared();

        for key in &keys {
            inner.entries.insert(
                key.clone(),
                Entry {
                    id,
                    state: Arc::clone(&state),
                    handle: handle.clone(),
                },
            );
        }
        trace!(flight = id, sessions = sessions.len(), "Registered flight");

        claim.started.push(handle);
        claim.launches.push(Launch {
            sessions,
            ticket: FlightTicket {
                registry: Arc::clone(self),
                id,
                keys,
                state,
            },
            tx,
        });
    }

    fn release(&self, id: u64, keys: &[FlightKey]) {
        let mut inner = self.lock();
        for key in keys {
            if inner.entries.get(key).is_some_and(|entry| entry.id == id) {
                inner.entries.remove(key);
            }
        }
        trace!(flight = id, "Released flight");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsync_core::Venue;
    use chrono::{NaiveDate, TimeZone};

    fn session(day: u32) -> Session {
        Session::new(
            Venue::new("XNYS"),
            NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, day, 14, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, day, 21, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn gaps(days: &[u32]) -> GapSet {
        let expected: Vec<Session> = (8..=12).map(session).collect();
        GapSet::select(&expected, |s| {
            days.contains(&chrono::Datelike::day(&s.trading_date))
        })
    }

    fn outcome() -> FlightOutcome {
        FlightOutcome {
            state: FlightState::Persisted,
            failed: Vec::new(),
            written: 0,
            error: None,
            storage_error: None,
        }
    }

    #[tokio::test]
    async fn test_overlapping_claim_joins() {
        let registry = Arc::new(FlightRegistry::default());
        let acme = Instrument::new("ACME", "XNYS");

        let first = registry.claim(&acme, Interval::Daily, &gaps(&[8, 9, 10]));
        assert_eq!(first.started.len(), 1);
        assert!(first.joined.is_empty());
        assert_eq!(registry.len(), 1);

        // 9 and 10 are in flight; 11 and 12 form a new flight.
        let second = registry.claim(&acme, Interval::Daily, &gaps(&[9, 10, 11, 12]));
        assert_eq!(second.joined.len(), 1);
        assert_eq!(second.started.len(), 1);
        assert_eq!(registry.len(), 2);

        let key = FlightKey::new(&acme, Interval::Daily, &session(9));
        assert_eq!(registry.state(&key), Some(FlightState::Pending));

        for launch in first.launches.into_iter().chain(second.launches) {
            launch.spawn(|_, ticket| async move {
                ticket.set_state(FlightState::Persisted);
                drop(ticket);
                outcome()
            });
        }
        for handle in first.started.into_iter().chain(second.started) {
            assert_eq!(handle.await.state, FlightState::Persisted);
        }
        assert_eq!(registry.len(), 0);
        assert_eq!(registry.state(&key), None);
    }

    #[tokio::test]
    async fn test_other_interval_does_not_join() {
        let registry = Arc::new(FlightRegistry::default());
        let acme = Instrument::new("ACME", "XNYS");
        let daily = registry.claim(&acme, Interval::Daily, &gaps(&[8]));
        let hourly = registry.claim(&acme, Interval::Hourly, &gaps(&[8]));
        assert!(hourly.joined.is_empty());
        assert_eq!(registry.len(), 2);
        drop(daily);
        drop(hourly);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_dropped_task_reports_failure() {
        let registry = Arc::new(FlightRegistry::default());
        let acme = Instrument::new("ACME", "XNYS");
        let claim = registry.claim(&acme, Interval::Daily, &gaps(&[8, 9]));
        let handle = claim.started[0].clone();
        drop(claim);

        let outcome = handle.await;
        assert_eq!(outcome.state, FlightState::Failed);
        assert_eq!(outcome.failed.len(), 2);
    }
}
