//! Multi-venue calendar oracle.

use std::collections::HashMap;

use barsync_core::{CalendarOracle, DataError, Interval, Result, Session, Venue};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exchange::ExchangeCalendar;

/// Which venue calendars to load and for which years.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Venue codes. `XNYS`/`NYSE` and `XNAS`/`NASDAQ` are recognized.
    pub venues: Vec<String>,
    /// First covered year.
    pub first_year: i32,
    /// Last covered year.
    pub last_year: i32,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            venues: vec!["XNYS".to_string()],
            first_year: 2000,
            last_year: 2035,
        }
    }
}

/// A set of exchange calendars keyed by venue.
#[derive(Clone, Debug, Default)]
pub struct CalendarSet {
    calendars: HashMap<Venue, ExchangeCalendar>,
}

impl CalendarSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a calendar, builder style.
    #[must_use]
    pub fn with(mut self, calendar: ExchangeCalendar) -> Self {
        self.insert(calendar);
        self
    }

    /// Adds or replaces the calendar of its venue.
    pub fn insert(&mut self, calendar: ExchangeCalendar) {
        self.calendars.insert(calendar.venue().clone(), calendar);
    }

    /// Looks up the calendar of `venue`.
    #[must_use]
    pub fn get(&self, venue: &Venue) -> Option<&ExchangeCalendar> {
        self.calendars.get(venue)
    }

    /// Loads the calendars named in `config`.
    ///
    /// # Errors
    /// Returns [`DataError::CalendarLoad`] for unknown venue codes or an
    /// invalid year range.
    pub fn from_config(config: &CalendarConfig) -> Result<Self> {
        let years = config.first_year..=config.last_year;
        let mut set = Self::new();
        for code in &config.venues {
            let venue = match code.to_uppercase().as_str() {
                "XNYS" | "NYSE" => Venue::new("XNYS"),
                "XNAS" | "NASDAQ" => Venue::new("XNAS"),
                other => {
                    return Err(DataError::CalendarLoad(format!(
                        "No calendar rules for venue {other}"
                    )));
                }
            };
            set.insert(ExchangeCalendar::nyse_rules(venue, years.clone())?);
        }
        info!(
            venues = set.calendars.len(),
            first_year = config.first_year,
            last_year = config.last_year,
            "Loaded trading calendars"
        );
        Ok(set)
    }

    fn calendar(&self, venue: &Venue) -> Result<&ExchangeCalendar> {
        self.calendars
            .get(venue)
            .ok_or_else(|| DataError::CalendarUnavailable(format!("No calendar for venue {venue}")))
    }
}

impl CalendarOracle for CalendarSet {
    fn sessions_in_range(
        &self,
        venue: &Venue,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        self.calendar(venue)?.sessions(interval, start, end)
    }

    fn trading_days(
        &self,
        venue: &Venue,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<NaiveDate>> {
        self.calendar(venue)?.trading_days(start, end)
    }

    fn venues(&self) -> Vec<Venue> {
        let mut venues: Vec<Venue> = self.calendars.keys().cloned().collect();
        venues.sort();
        venues
    }
}
