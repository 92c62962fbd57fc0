//! Single-venue exchange calendar.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use barsync_core::{DataError, Interval, Result, Session, Venue};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use tracing::debug;

use crate::rules;

/// Years a calendar may cover; rule sets are not meaningful outside this span.
const SUPPORTED_YEARS: RangeInclusive<i32> = 1970..=2200;

/// Trading calendar of one venue.
///
/// Holds the venue timezone, regular and early-close hours, weekend days and
/// the explicit holiday and early-close dates for a covered span of years.
/// Queries outside the covered years fail instead of guessing.
#[derive(Clone, Debug)]
pub struct ExchangeCalendar {
    venue: Venue,
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    early_close: NaiveTime,
    weekend: Vec<Weekday>,
    holidays: BTreeSet<NaiveDate>,
    early_closes: BTreeSet<NaiveDate>,
    years: RangeInclusive<i32>,
}

impl ExchangeCalendar {
    /// NYSE calendar (`XNYS`) for the given years.
    ///
    /// # Errors
    /// Returns [`DataError::CalendarLoad`] if the year range is empty or
    /// unsupported.
    pub fn xnys(years: RangeInclusive<i32>) -> Result<Self> {
        Self::nyse_rules(Venue::new("XNYS"), years)
    }

    /// A calendar for `venue` following NYSE hours and holidays
    /// (09:30-16:00 America/New_York, 13:00 early closes).
    ///
    /// # Errors
    /// Returns [`DataError::CalendarLoad`] if the year range is empty or
    /// unsupported.
    pub fn nyse_rules(venue: Venue, years: RangeInclusive<i32>) -> Result<Self> {
        validate_years(&years)?;
        let holidays = years.clone().flat_map(rules::nyse_holidays);
        let early_closes = years.clone().flat_map(rules::nyse_early_closes);

        let calendar = Self::builder(venue, chrono_tz::America::New_York)
            .hours(hm(9, 30)?, hm(16, 0)?)
            .early_close_time(hm(13, 0)?)
            .holidays(holidays)
            .early_closes(early_closes)
            .years(years)
            .build()?;

        debug!(
            venue = %calendar.venue,
            holidays = calendar.holidays.len(),
            early_closes = calendar.early_closes.len(),
            "Loaded NYSE-rule calendar"
        );
        Ok(calendar)
    }

    /// Starts a custom calendar for `venue` in `timezone`.
    ///
    /// Defaults: 09:30-16:00 hours, Saturday/Sunday weekend, no holidays,
    /// years 2000-2050. Without [`early_close_time`](ExchangeCalendarBuilder::early_close_time)
    /// early-close days close at the regular time.
    #[must_use]
    pub fn builder(venue: Venue, timezone: Tz) -> ExchangeCalendarBuilder {
        ExchangeCalendarBuilder {
            venue,
            timezone,
            open: NaiveTime::from_hms_opt(9, 30, 0),
            close: NaiveTime::from_hms_opt(16, 0, 0),
            early_close: None,
            weekend: vec![Weekday::Sat, Weekday::Sun],
            holidays: BTreeSet::new(),
            early_closes: BTreeSet::new(),
            years: 2000..=2050,
        }
    }

    /// The venue this calendar describes.
    #[must_use]
    pub fn venue(&self) -> &Venue {
        &self.venue
    }

    /// The venue-local timezone.
    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Returns true if `date` is a full holiday.
    #[must_use]
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Returns true if `date` closes early.
    #[must_use]
    pub fn is_early_close(&self, date: NaiveDate) -> bool {
        self.early_closes.contains(&date)
    }

    /// Returns whether `date` is a trading day.
    ///
    /// # Errors
    /// Returns [`DataError::CalendarUnavailable`] outside the covered years.
    pub fn is_trading_day(&self, date: NaiveDate) -> Result<bool> {
        self.check_coverage(date)?;
        Ok(!self.weekend.contains(&date.weekday()) && !self.holidays.contains(&date))
    }

    /// UTC open and close of `date`, or `None` if the venue does not trade.
    ///
    /// # Errors
    /// Returns [`DataError::CalendarUnavailable`] outside the covered years or
    /// if the local hours do not exist on that date.
    pub fn trading_hours(&self, date: NaiveDate) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        if !self.is_trading_day(date)? {
            return Ok(None);
        }
        let close = if self.early_closes.contains(&date) {
            self.early_close
        } else {
            self.close
        };
        Ok(Some((self.to_utc(date, self.open)?, self.to_utc(date, close)?)))
    }

    /// Trading days in `[start, end]` (venue-local dates).
    ///
    /// # Errors
    /// Returns [`DataError::CalendarUnavailable`] if the range leaves the
    /// covered years.
    pub fn trading_days(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>> {
        if start > end {
            return Ok(Vec::new());
        }
        self.check_coverage(start)?;
        self.check_coverage(end)?;
        let mut days = Vec::new();
        for date in start.iter_days().take_while(|d| *d <= end) {
            if self.is_trading_day(date)? {
                days.push(date);
            }
        }
        Ok(days)
    }

    /// Sessions at `interval` fully contained in `[start, end]`.
    ///
    /// Daily sessions span open to close. Intraday sessions slice each trading
    /// day from the open; the last slice is cut at the (early) close.
    ///
    /// # Errors
    /// [`DataError::InvalidParameter`] if `start > end`,
    /// [`DataError::CalendarUnavailable`] if the range leaves the covered years.
    pub fn sessions(
        &self,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Session>> {
        if start > end {
            return Err(DataError::InvalidParameter(format!(
                "Range start {start} is after end {end}"
            )));
        }
        let first_day = start.with_timezone(&self.timezone).date_naive();
        let last_day = end.with_timezone(&self.timezone).date_naive();

        let mut sessions = Vec::new();
        for date in self.trading_days(first_day, last_day)? {
            let Some((open, close)) = self.trading_hours(date)? else {
                continue;
            };
            if interval.is_intraday() {
                let step = interval.duration();
                let mut slice_start = open;
                while slice_start < close {
                    let slice_end = (slice_start + step).min(close);
                    sessions.push(Session::new(
                        self.venue.clone(),
                        date,
                        slice_start,
                        slice_end,
                    )?);
                    slice_start = slice_end;
                }
            } else {
                sessions.push(Session::new(self.venue.clone(), date, open, close)?);
            }
        }

        sessions.retain(|s| s.start >= start && s.end <= end);
        Ok(sessions)
    }

    fn check_coverage(&self, date: NaiveDate) -> Result<()> {
        if self.years.contains(&date.year()) {
            Ok(())
        } else {
            Err(DataError::CalendarUnavailable(format!(
                "{} calendar covers {}-{}, requested {date}",
                self.venue,
                self.years.start(),
                self.years.end()
            )))
        }
    }

    fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&date.and_time(time))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| {
                DataError::CalendarUnavailable(format!(
                    "{date} {time} does not exist in {}",
                    self.timezone
                ))
            })
    }
}

/// Builder for [`ExchangeCalendar`].
#[derive(Debug)]
pub struct ExchangeCalendarBuilder {
    venue: Venue,
    timezone: Tz,
    open: Option<NaiveTime>,
    close: Option<NaiveTime>,
    early_close: Option<NaiveTime>,
    weekend: Vec<Weekday>,
    holidays: BTreeSet<NaiveDate>,
    early_closes: BTreeSet<NaiveDate>,
    years: RangeInclusive<i32>,
}

impl ExchangeCalendarBuilder {
    /// Sets regular opening and closing times (venue-local).
    #[must_use]
    pub fn hours(mut self, open: NaiveTime, close: NaiveTime) -> Self {
        self.open = Some(open);
        self.close = Some(close);
        self
    }

    /// Sets the closing time used on early-close days.
    #[must_use]
    pub fn early_close_time(mut self, time: NaiveTime) -> Self {
        self.early_close = Some(time);
        self
    }

    /// Replaces the weekend days.
    #[must_use]
    pub fn weekend(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.weekend = days.into_iter().collect();
        self
    }

    /// Adds a full holiday.
    #[must_use]
    pub fn holiday(mut self, date: NaiveDate) -> Self {
        self.holidays.insert(date);
        self
    }

    /// Adds several full holidays.
    #[must_use]
    pub fn holidays(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(dates);
        self
    }

    /// Adds an early-close day.
    #[must_use]
    pub fn early_close(mut self, date: NaiveDate) -> Self {
        self.early_closes.insert(date);
        self
    }

    /// Adds several early-close days.
    #[must_use]
    pub fn early_closes(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.early_closes.extend(dates);
        self
    }

    /// Sets the covered years.
    #[must_use]
    pub fn years(mut self, years: RangeInclusive<i32>) -> Self {
        self.years = years;
        self
    }

    /// Validates and builds the calendar.
    ///
    /// # Errors
    /// Returns [`DataError::CalendarLoad`] if the hours are missing or not
    /// ordered (`open < early close <= close`), or the years are invalid.
    pub fn build(self) -> Result<ExchangeCalendar> {
        let (Some(open), Some(close)) = (self.open, self.close) else {
            return Err(DataError::CalendarLoad(format!(
                "{}: trading hours are not set",
                self.venue
            )));
        };
        let early_close = self.early_close.unwrap_or(close);
        if !(open < early_close && early_close <= close) {
            return Err(DataError::CalendarLoad(format!(
                "{}: hours must satisfy open < early close <= close",
                self.venue
            )));
        }
        validate_years(&self.years)?;

        Ok(ExchangeCalendar {
            venue: self.venue,
            timezone: self.timezone,
            open,
            close,
            early_close,
            weekend: self.weekend,
            holidays: self.holidays,
            early_closes: self.early_closes,
            years: self.years,
        })
    }
}

fn validate_years(years: &RangeInclusive<i32>) -> Result<()> {
    if years.is_empty()
        || !SUPPORTED_YEARS.contains(years.start())
        || !SUPPORTED_YEARS.contains(years.end())
    {
        return Err(DataError::CalendarLoad(format!(
            "Unsupported calendar years {}-{}",
            years.start(),
            years.end()
        )));
    }
    Ok(())
}

fn hm(hour: u32, minute: u32) -> Result<NaiveTime> {
    NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| DataError::CalendarLoad(format!("Invalid time {hour}:{minute}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn xnys() -> ExchangeCalendar {
        ExchangeCalendar::xnys(2020..=2030).unwrap()
    }

    #[test]
    fn test_weekends_excluded() {
        let days = xnys().trading_days(ymd(2025, 1, 1), ymd(2025, 1, 15)).unwrap();
        for weekend in [ymd(2025, 1, 4), ymd(2025, 1, 5), ymd(2025, 1, 11), ymd(2025, 1, 12)] {
            assert!(!days.contains(&weekend));
        }
        // Jan 1 holiday and Jan 9 closure leave 9 sessions.
        assert_eq!(days.len(), 9);
    }

    #[test]
    fn test_single_holiday_has_no_days() {
        let cal = xnys();
        for day in [ymd(2025, 1, 20), ymd(2025, 4, 18), ymd(2025, 11, 27), ymd(2025, 12, 25)] {
            assert!(cal.trading_days(day, day).unwrap().is_empty(), "{day}");
        }
    }

    #[test]
    fn test_daily_session_bounds_follow_dst() {
        let cal = xnys();
        // EST in January, EDT in July.
        let (open, close) = cal.trading_hours(ymd(2024, 1, 2)).unwrap().unwrap();
        assert_eq!(open, utc(2024, 1, 2, 14, 30));
        assert_eq!(close, utc(2024, 1, 2, 21, 0));
        let (open, close) = cal.trading_hours(ymd(2024, 7, 2)).unwrap().unwrap();
        assert_eq!(open, utc(2024, 7, 2, 13, 30));
        assert_eq!(close, utc(2024, 7, 2, 20, 0));
    }

    #[test]
    fn test_daily_sessions_week() {
        let cal = xnys();
        let sessions = cal
            .sessions(Interval::Daily, utc(2024, 1, 8, 0, 0), utc(2024, 1, 12, 23, 59))
            .unwrap();
        assert_eq!(sessions.len(), 5);
        assert!(sessions.windows(2).all(|w| w[0].end <= w[1].start));
        assert_eq!(sessions[0].trading_date, ymd(2024, 1, 8));
        assert_eq!(sessions[4].trading_date, ymd(2024, 1, 12));
    }

    #[test]
    fn test_intraday_split_and_early_close() {
        let cal = xnys();
        let regular = cal
            .sessions(Interval::ThirtyMinute, utc(2024, 7, 2, 0, 0), utc(2024, 7, 2, 23, 0))
            .unwrap();
        assert_eq!(regular.len(), 13);
        assert!(regular.iter().all(|s| s.end - s.start == TimeDelta::minutes(30)));

        let early = cal
            .sessions(Interval::ThirtyMinute, utc(2024, 7, 3, 0, 0), utc(2024, 7, 3, 23, 0))
            .unwrap();
        assert_eq!(early.len(), 7);
        assert_eq!(early.last().unwrap().end, utc(2024, 7, 3, 17, 0));
    }

    #[test]
    fn test_hourly_last_slice_truncated() {
        let cal = xnys();
        let sessions = cal
            .sessions(Interval::Hourly, utc(2024, 7, 2, 0, 0), utc(2024, 7, 2, 23, 0))
            .unwrap();
        assert_eq!(sessions.len(), 7);
        let last = sessions.last().unwrap();
        assert_eq!(last.start, utc(2024, 7, 2, 19, 30));
        assert_eq!(last.end, utc(2024, 7, 2, 20, 0));
    }

    #[test]
    fn test_partial_sessions_excluded() {
        let cal = xnys();
        let sessions = cal
            .sessions(Interval::Daily, utc(2024, 1, 2, 15, 0), utc(2024, 1, 3, 23, 0))
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].trading_date, ymd(2024, 1, 3));
    }

    #[test]
    fn test_coverage_and_validation() {
        let cal = xnys();
        assert!(matches!(
            cal.trading_days(ymd(2031, 1, 2), ymd(2031, 1, 3)),
            Err(DataError::CalendarUnavailable(_))
        ));
        assert!(matches!(
            cal.sessions(Interval::Daily, utc(2024, 1, 3, 0, 0), utc(2024, 1, 2, 0, 0)),
            Err(DataError::InvalidParameter(_))
        ));
        #[allow(clippy::reversed_empty_ranges)]
        let empty = 2030..=2020;
        assert!(matches!(
            ExchangeCalendar::xnys(empty),
            Err(DataError::CalendarLoad(_))
        ));
    }

    #[test]
    fn test_builder_rejects_bad_hours() {
        let result = ExchangeCalendar::builder(Venue::new("TEST"), chrono_tz::UTC)
            .hours(hm(16, 0).unwrap(), hm(9, 0).unwrap())
            .build();
        assert!(matches!(result, Err(DataError::CalendarLoad(_))));
    }

    #[test]
    fn test_builder_early_close_defaults_to_close() {
        let cal = ExchangeCalendar::builder(Venue::new("TEST"), chrono_tz::UTC)
            .hours(hm(14, 0).unwrap(), hm(18, 0).unwrap())
            .build()
            .unwrap();
        let sessions = cal
            .sessions(Interval::Daily, utc(2024, 1, 2, 0, 0), utc(2024, 1, 3, 0, 0))
            .unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].start, utc(2024, 1, 2, 14, 0));
        assert_eq!(sessions[0].end, utc(2024, 1, 2, 18, 0));

        let cal = ExchangeCalendar::builder(Venue::new("TEST"), chrono_tz::UTC)
            .hours(hm(14, 0).unwrap(), hm(18, 0).unwrap())
            .early_close(ymd(2024, 1, 2))
            .build()
            .unwrap();
        let sessions = cal
            .sessions(Interval::Daily, utc(2024, 1, 2, 0, 0), utc(2024, 1, 3, 0, 0))
            .unwrap();
        assert_eq!(sessions[0].end, utc(2024, 1, 2, 18, 0));
    }

    #[test]
    fn test_synthetic_calendar() {
        let cal = ExchangeCalendar::builder(Venue::new("TEST"), chrono_tz::UTC)
            .hours(hm(10, 0).unwrap(), hm(12, 0).unwrap())
            .early_close_time(hm(11, 0).unwrap())
            .holiday(ymd(2024, 1, 3))
            .early_close(ymd(2024, 1, 4))
            .build()
            .unwrap();
        let sessions = cal
            .sessions(Interval::Hourly, utc(2024, 1, 2, 0, 0), utc(2024, 1, 4, 23, 0))
            .unwrap();
        let dates: Vec<NaiveDate> = sessions.iter().map(|s| s.trading_date).collect();
        assert_eq!(dates, vec![ymd(2024, 1, 2), ymd(2024, 1, 2), ymd(2024, 1, 4)]);
    }
}
