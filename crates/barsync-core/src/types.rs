//! Core data types for bar synchronization.
//!
//! This module defines the fundamental data structures:
//!
//! - [`Symbol`] and [`Venue`] - identifiers, combined into an [`Instrument`]
//! - [`Session`] - a calendar-derived trading period
//! - [`RawBar`] - a provider bar before it is assigned to a session
//! - [`Bar`] - an OHLCV bar bound to an instrument, interval and session
//! - [`BarKey`] - the cache identity of a bar
//! - [`CacheRecord`] - a persisted bar plus its cache provenance

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DataError, Result};
use crate::interval::Interval;

/// A trading symbol/ticker.
///
/// Symbols are automatically uppercased on creation.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    /// Creates a new symbol from a string, converting to uppercase.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    /// Returns the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Symbol {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A trading venue code (e.g. `XNYS`).
///
/// Venue codes are uppercased on creation.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Venue(String);

impl Venue {
    /// Creates a venue code, converting to uppercase.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_uppercase())
    }

    /// Returns the venue code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Venue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A tradable instrument: a symbol listed on a venue.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Instrument {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Listing venue, which selects the trading calendar.
    pub venue: Venue,
}

impl Instrument {
    /// Creates an instrument from a symbol and a venue.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, venue: impl Into<Venue>) -> Self {
        Self {
            symbol: symbol.into(),
            venue: venue.into(),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.venue)
    }
}

/// A trading period produced by a trading calendar.
///
/// Sessions of one venue are strictly ordered by `start` and never overlap.
/// Ordering compares the venue first, then the start.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Session {
    /// Venue whose calendar produced the session.
    pub venue: Venue,
    /// Inclusive start of the period.
    pub start: DateTime<Utc>,
    /// Exclusive end of the period.
    pub end: DateTime<Utc>,
    /// Venue-local trading date the period belongs to.
    pub trading_date: NaiveDate,
}

impl Session {
    /// Creates a session.
    ///
    /// Intended for calendar implementations; other code receives sessions
    /// from a [`CalendarOracle`](crate::calendar::CalendarOracle).
    ///
    /// # Errors
    /// Returns [`DataError::InvalidParameter`] if `start >= end`.
    pub fn new(
        venue: Venue,
        trading_date: NaiveDate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        if start >= end {
            return Err(DataError::InvalidParameter(format!(
                "Session start {start} is not before end {end}"
            )));
        }
        Ok(Self {
            venue,
            start,
            end,
            trading_date,
        })
    }

    /// Returns true if `ts` falls inside `[start, end)`.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{} .. {})",
            self.venue,
            self.trading_date,
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }
}

/// A bar as returned by a provider, before session assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    /// Provider timestamp of the bar (usually its start).
    pub timestamp: DateTime<Utc>,
    /// Opening price.
    pub open: f64,
    /// Highest price during the period.
    pub high: f64,
    /// Lowest price during the period.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// Volume-weighted average price, if reported.
    pub vwap: Option<f64>,
    /// Number of trades, if reported.
    pub transactions: Option<u64>,
}

impl RawBar {
    /// Creates a raw bar without vwap or trade count.
    #[must_use]
    pub const fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            vwap: None,
            transactions: None,
        }
    }
}

/// An OHLCV bar bound to an instrument, interval and session.
///
/// Once persisted under its [`BarKey`], a bar only changes through an explicit
/// overwrite.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Instrument the bar describes.
    pub instrument: Instrument,
    /// Bar granularity.
    pub interval: Interval,
    /// Session the bar covers.
    pub session: Session,
    /// Opening price.
    pub open: f64,
    /// Highest price during the session.
    pub high: f64,
    /// Lowest price during the session.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// Volume-weighted average price, if reported.
    pub vwap: Option<f64>,
    /// Number of trades, if reported.
    pub transactions: Option<u64>,
    /// When the bar was received from the provider.
    pub provenance: DateTime<Utc>,
}

impl Bar {
    /// Binds a raw provider bar to a session.
    #[must_use]
    pub fn from_raw(
        instrument: Instrument,
        interval: Interval,
        session: Session,
        raw: &RawBar,
        provenance: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument,
            interval,
            session,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            vwap: raw.vwap,
            transactions: raw.transactions,
            provenance,
        }
    }

    /// Returns the cache identity of this bar.
    #[must_use]
    pub fn key(&self) -> BarKey {
        BarKey {
            instrument: self.instrument.clone(),
            interval: self.interval,
            session_start: self.session.start,
        }
    }

    /// Checks the OHLCV invariants.
    ///
    /// # Errors
    /// Returns [`DataError::InvalidBar`] if a price is not finite, the high is
    /// below any other price, the low is above any other price, or the volume
    /// is negative.
    pub fn validate(&self) -> Result<()> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return Err(DataError::InvalidBar(format!(
                "{} {}: non-finite value",
                self.instrument, self.session
            )));
        }
        if self.high < self.open.max(self.close).max(self.low) {
            return Err(DataError::InvalidBar(format!(
                "{} {}: high {} below open/close/low",
                self.instrument, self.session, self.high
            )));
        }
        if self.low > self.open.min(self.close).min(self.high) {
            return Err(DataError::InvalidBar(format!(
                "{} {}: low {} above open/close/high",
                self.instrument, self.session, self.low
            )));
        }
        if self.volume < 0.0 {
            return Err(DataError::InvalidBar(format!(
                "{} {}: negative volume {}",
                self.instrument, self.session, self.volume
            )));
        }
        Ok(())
    }

    /// Compares market fields only, ignoring provenance.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        self.instrument == other.instrument
            && self.interval == other.interval
            && self.session == other.session
            && self.open == other.open
            && self.high == other.high
            && self.low == other.low
            && self.close == other.close
            && self.volume == other.volume
            && self.vwap == other.vwap
            && self.transactions == other.transactions
    }
}

/// Cache identity of a bar: `(instrument, interval, session start)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BarKey {
    /// Instrument (symbol and venue).
    pub instrument: Instrument,
    /// Bar granularity.
    pub interval: Interval,
    /// Start of the session.
    pub session_start: DateTime<Utc>,
}

impl fmt::Display for BarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.instrument,
            self.interval,
            self.session_start.to_rfc3339()
        )
    }
}

/// A persisted bar together with its cache provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The stored bar.
    pub bar: Bar,
    /// When the bar was last written.
    pub cached_at: DateTime<Utc>,
    /// 1 on first write, incremented by every explicit overwrite.
    pub revision: u32,
}

impl CacheRecord {
    /// Creates a first-revision record for a bar.
    #[must_use]
    pub const fn new(bar: Bar, cached_at: DateTime<Utc>) -> Self {
        Self {
            bar,
            cached_at,
            revision: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn session() -> Session {
        Session::new(
            Venue::new("xnys"),
            NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 20, 13, 30, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 20, 20, 0, 0).unwrap(),
        )
        .unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Bar {
        Bar {
            instrument: Instrument::new("aapl", "xnys"),
            interval: Interval::Daily,
            session: session(),
            open,
            high,
            low,
            close,
            volume,
            vwap: None,
            transactions: None,
            provenance: Utc::now(),
        }
    }

    #[test]
    fn test_identifiers_uppercase() {
        let instrument = Instrument::new("aapl", "xnys");
        assert_eq!(instrument.to_string(), "AAPL@XNYS");
    }

    #[test]
    fn test_session_rejects_empty_period() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 20, 13, 30, 0).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        assert!(Session::new(Venue::new("XNYS"), date, ts, ts).is_err());
    }

    #[test]
    fn test_session_contains_is_half_open() {
        let s = session();
        assert!(s.contains(s.start));
        assert!(!s.contains(s.end));
    }

    #[test]
    fn test_bar_validation() {
        assert!(bar(150.2, 150.35, 150.15, 150.3, 1000.0).validate().is_ok());
        assert!(bar(150.2, 150.1, 150.15, 150.3, 1000.0).validate().is_err());
        assert!(bar(150.2, 150.35, 150.25, 150.3, 1000.0).validate().is_err());
        assert!(bar(150.2, 150.35, 150.15, 150.3, -1.0).validate().is_err());
        assert!(bar(f64::NAN, 150.35, 150.15, 150.3, 1.0).validate().is_err());
    }

    #[test]
    fn test_same_payload_ignores_provenance() {
        let a = bar(1.0, 2.0, 0.5, 1.5, 10.0);
        let mut b = a.clone();
        b.provenance = a.provenance + chrono::TimeDelta::hours(1);
        assert!(a.same_payload(&b));
        b.close = 1.6;
        assert!(!a.same_payload(&b));
    }
}
