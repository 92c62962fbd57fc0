//! Holiday and early-close rules for US equity venues.

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Unscheduled full-day NYSE closures (weather, national mourning, 9/11).
const NYSE_SPECIAL_CLOSURES: &[(i32, u32, u32)] = &[
    (2001, 9, 11),
    (2001, 9, 12),
    (2001, 9, 13),
    (2001, 9, 14),
    (2004, 6, 11),
    (2007, 1, 2),
    (2012, 10, 29),
    (2012, 10, 30),
    (2018, 12, 5),
    (2025, 1, 9),
];

/// Gregorian Easter Sunday (anonymous Gregorian algorithm).
#[must_use]
pub fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

/// The `n`-th `weekday` of a month (1-based).
#[must_use]
pub fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

/// The last `weekday` of a month.
#[must_use]
pub fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    let mut date = first_of_next.pred_opt()?;
    while date.weekday() != weekday {
        date = date.pred_opt()?;
    }
    Some(date)
}

/// Saturday holidays are observed on Friday, Sunday holidays on Monday.
#[must_use]
pub fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

/// Full-day NYSE holidays for `year`, including unscheduled closures.
#[must_use]
pub fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(12);

    // New Year's Day: a Saturday holiday is not moved into the prior year.
    if let Some(new_year) = NaiveDate::from_ymd_opt(year, 1, 1) {
        match new_year.weekday() {
            Weekday::Sat => {}
            Weekday::Sun => days.push(new_year + Duration::days(1)),
            _ => days.push(new_year),
        }
    }

    if year >= 1998 {
        days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    }
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    days.extend(easter_sunday(year).map(|e| e - Duration::days(2)));
    days.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        days.extend(NaiveDate::from_ymd_opt(year, 6, 19).map(observed));
    }
    days.extend(NaiveDate::from_ymd_opt(year, 7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    days.extend(NaiveDate::from_ymd_opt(year, 12, 25).map(observed));

    days.extend(
        NYSE_SPECIAL_CLOSURES
            .iter()
            .filter(|(y, _, _)| *y == year)
            .filter_map(|&(y, m, d)| NaiveDate::from_ymd_opt(y, m, d)),
    );

    days.sort_unstable();
    days.dedup();
    days
}

/// NYSE 13:00 early closes for `year`.
///
/// July 3 and Christmas Eve close early when they fall Monday through
/// Thursday; the day after Thanksgiving always closes early.
#[must_use]
pub fn nyse_early_closes(year: i32) -> Vec<NaiveDate> {
    let mon_to_thu = |d: &NaiveDate| {
        matches!(
            d.weekday(),
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu
        )
    };

    let mut days = Vec::with_capacity(3);
    days.extend(NaiveDate::from_ymd_opt(year, 7, 3).filter(mon_to_thu));
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4).map(|t| t + Duration::days(1)));
    days.extend(NaiveDate::from_ymd_opt(year, 12, 24).filter(mon_to_thu));
    days.sort_unstable();
    days
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_easter() {
        assert_eq!(easter_sunday(2024), Some(ymd(2024, 3, 31)));
        assert_eq!(easter_sunday(2025), Some(ymd(2025, 4, 20)));
        assert_eq!(easter_sunday(2019), Some(ymd(2019, 4, 21)));
    }

    #[test]
    fn test_nyse_2025_holidays() {
        let holidays = nyse_holidays(2025);
        for day in [
            ymd(2025, 1, 1),
            ymd(2025, 1, 9),
            ymd(2025, 1, 20),
            ymd(2025, 2, 17),
            ymd(2025, 4, 18),
            ymd(2025, 5, 26),
            ymd(2025, 6, 19),
            ymd(2025, 7, 4),
            ymd(2025, 9, 1),
            ymd(2025, 11, 27),
            ymd(2025, 12, 25),
        ] {
            assert!(holidays.contains(&day), "{day} should be a holiday");
        }
        assert_eq!(holidays.len(), 11);
    }

    #[test]
    fn test_weekend_observance() {
        // July 4, 2026 is a Saturday; Christmas 2022 a Sunday.
        assert!(nyse_holidays(2026).contains(&ymd(2026, 7, 3)));
        assert!(nyse_holidays(2022).contains(&ymd(2022, 12, 26)));
        // New Year's Day 2022 fell on a Saturday and was not observed.
        assert!(!nyse_holidays(2021).contains(&ymd(2021, 12, 31)));
        assert!(!nyse_holidays(2022).contains(&ymd(2021, 12, 31)));
    }

    #[test]
    fn test_juneteenth_starts_2022() {
        assert!(!nyse_holidays(2021).contains(&ymd(2021, 6, 18)));
        assert!(nyse_holidays(2022).contains(&ymd(2022, 6, 20)));
    }

    #[test]
    fn test_early_closes() {
        assert_eq!(
            nyse_early_closes(2024),
            vec![ymd(2024, 7, 3), ymd(2024, 11, 29), ymd(2024, 12, 24)]
        );
        // July 3, 2026 is the observed holiday (a Friday), Christmas Eve a Thursday.
        assert_eq!(
            nyse_early_closes(2026),
            vec![ymd(2026, 11, 27), ymd(2026, 12, 24)]
        );
    }
}
