//! Bar interval definitions.
//!
//! This module defines [`Interval`], the fixed set of bar granularities the
//! engine synchronizes.

use std::fmt;
use std::str::FromStr;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Granularity of a bar series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Interval {
    /// One-minute bars.
    Minute,
    /// Five-minute bars.
    FiveMinute,
    /// Fifteen-minute bars.
    FifteenMinute,
    /// Thirty-minute bars.
    ThirtyMinute,
    /// Hourly bars.
    Hourly,
    /// One bar per trading day.
    Daily,
}

impl Interval {
    /// All supported intervals, finest first.
    pub const ALL: [Self; 6] = [
        Self::Minute,
        Self::FiveMinute,
        Self::FifteenMinute,
        Self::ThirtyMinute,
        Self::Hourly,
        Self::Daily,
    ];

    /// Returns true for every interval finer than a trading day.
    #[must_use]
    pub const fn is_intraday(&self) -> bool {
        !matches!(self, Self::Daily)
    }

    /// Nominal length of one bar. Daily bars are one calendar day nominally;
    /// their real bounds come from the trading calendar.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        match self {
            Self::Minute => TimeDelta::minutes(1),
            Self::FiveMinute => TimeDelta::minutes(5),
            Self::FifteenMinute => TimeDelta::minutes(15),
            Self::ThirtyMinute => TimeDelta::minutes(30),
            Self::Hourly => TimeDelta::hours(1),
            Self::Daily => TimeDelta::days(1),
        }
    }

    /// Short code used in storage keys and configuration (`1m`, `1d`, ...).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Minute => "1m",
            Self::FiveMinute => "5m",
            Self::FifteenMinute => "15m",
            Self::ThirtyMinute => "30m",
            Self::Hourly => "1h",
            Self::Daily => "1d",
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.code() == s)
            .ok_or_else(|| DataError::Parse(format!("Unknown interval code: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip() {
        for interval in Interval::ALL {
            assert_eq!(interval.code().parse::<Interval>().unwrap(), interval);
        }
        assert!("2m".parse::<Interval>().is_err());
    }

    #[test]
    fn test_intraday() {
        assert!(Interval::FiveMinute.is_intraday());
        assert!(!Interval::Daily.is_intraday());
        assert_eq!(Interval::Hourly.duration(), TimeDelta::minutes(60));
    }
}
