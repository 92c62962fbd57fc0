//! Trading calendar abstraction.

use chrono::{DateTime, NaiveDate, Utc};
use std::fmt::Debug;

use crate::{
    error::Result,
    interval::Interval,
    types::{Session, Venue},
};

/// Authority on which sessions a venue trades.
///
/// Implementations load their metadata at construction and are side-effect
/// free afterwards, so one instance can be shared by reference across all
/// queries. Tests substitute synthetic calendars through this trait.
pub trait CalendarOracle: Send + Sync + Debug {
    /// Returns every session of `venue` at `interval` that lies fully inside
    /// the closed range `[start, end]`, ordered by start.
    ///
    /// Holidays and weekends produce no sessions. Intraday intervals split each
    /// trading day into interval-sized sessions between open and close.
    ///
    /// # Errors
    /// [`DataError::CalendarUnavailable`](crate::DataError::CalendarUnavailable)
    /// if the venue is unknown or the range is outside the loaded coverage,
    /// [`DataError::InvalidParameter`](crate::DataError::InvalidParameter) if
    /// `start > end`.
    fn sessions_in_range(
        &self,
        venue: &Venue,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>>;

    /// Returns true if `session` is exactly one of the sessions the venue's
    /// calendar produces at `interval`.
    fn is_session(&self, interval: Interval, session: &Session) -> Result<bool> {
        let sessions =
            self.sessions_in_range(&session.venue, interval, session.start, session.end)?;
        Ok(sessions.iter().any(|s| s == session))
    }

    /// Returns the venue-local trading dates in `[start, end]`.
    fn trading_days(&self, venue: &Venue, start: NaiveDate, end: NaiveDate)
    -> Result<Vec<NaiveDate>>;

    /// Venues this oracle can answer for.
    fn venues(&self) -> Vec<Venue>;
}
