//! Gap detection against an expected session sequence.

use std::collections::BTreeSet;

use crate::types::Session;

/// A maximal run of gap sessions that are adjacent in calendar order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionRun {
    sessions: Vec<Session>,
}

impl SessionRun {
    /// Sessions of the run, ordered by start. Never empty.
    #[must_use]
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// Number of sessions in the run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Always false; runs are never empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// First session of the run.
    #[must_use]
    pub fn first(&self) -> &Session {
        &self.sessions[0]
    }

    /// Last session of the run.
    #[must_use]
    pub fn last(&self) -> &Session {
        &self.sessions[self.sessions.len() - 1]
    }

    /// Consumes the run and returns its sessions.
    #[must_use]
    pub fn into_sessions(self) -> Vec<Session> {
        self.sessions
    }
}

/// Sessions that are expected by the calendar but absent from the cache.
///
/// A gap set is computed per query and never persisted. Contiguity is judged
/// against the expected sequence, not wall-clock time: the Friday and Monday
/// sessions of a normal week are adjacent, while two sessions separated by a
/// cached one are not.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GapSet {
    runs: Vec<SessionRun>,
}

impl GapSet {
    /// Builds the gap set of `expected` sessions that are not in `present`.
    #[must_use]
    pub fn from_expected(expected: &[Session], present: &BTreeSet<Session>) -> Self {
        Self::select(expected, |s| !present.contains(s))
    }

    /// Treats every expected session as a gap.
    #[must_use]
    pub fn all(expected: &[Session]) -> Self {
        Self::select(expected, |_| true)
    }

    /// Builds the gap set of `expected` sessions for which `is_gap` holds.
    #[must_use]
    pub fn select(expected: &[Session], is_gap: impl Fn(&Session) -> bool) -> Self {
        let mut runs = Vec::new();
        let mut current: Vec<Session> = Vec::new();

        for session in expected {
            if is_gap(session) {
                current.push(session.clone());
            } else if !current.is_empty() {
                runs.push(SessionRun {
                    sessions: std::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            runs.push(SessionRun { sessions: current });
        }

        Self { runs }
    }

    /// Returns true if nothing is missing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Number of missing sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.runs.iter().map(SessionRun::len).sum()
    }

    /// Maximal contiguous runs, in calendar order.
    #[must_use]
    pub fn runs(&self) -> &[SessionRun] {
        &self.runs
    }

    /// Consumes the set and returns its runs.
    #[must_use]
    pub fn into_runs(self) -> Vec<SessionRun> {
        self.runs
    }

    /// Iterates over all missing sessions in order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.runs.iter().flat_map(|r| r.sessions.iter())
    }

    /// Returns true if `session` is missing.
    #[must_use]
    pub fn contains(&self, session: &Session) -> bool {
        self.sessions().any(|s| s == session)
    }
}
