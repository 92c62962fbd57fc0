//! Read-side transforms over synchronized series.
//!
//! - [`fill_missing`] - align a series to its expected sessions, synthesizing
//!   quiet sessions
//! - [`aggregate`] - combine finer bars into one coarser bar

use chrono::TimeDelta;
use std::collections::HashMap;

use crate::{
    error::{DataError, Result},
    interval::Interval,
    types::{Bar, Session},
};

/// A bar aligned to an expected session, possibly synthesized.
#[derive(Clone, Debug, PartialEq)]
pub struct FilledBar {
    /// The observed or synthesized bar.
    pub bar: Bar,
    /// True if no bar was observed for the session.
    pub synthetic: bool,
}

/// How far the first observation may lie from the first expected session
/// before leading sessions are left empty instead of back-filled.
#[must_use]
pub fn backfill_threshold(interval: Interval) -> TimeDelta {
    if interval.is_intraday() {
        TimeDelta::minutes(60)
    } else {
        TimeDelta::days(1)
    }
}

/// Aligns `bars` to `expected`, synthesizing bars for sessions without trades.
///
/// This assumes the instrument traded throughout the range and that missing
/// sessions simply had no activity:
///
/// - after the first observed bar, a missing session repeats the previous
///   close for open/high/low/close with zero volume, vwap and trade count;
/// - before it, sessions are back-filled from the first observed open only
///   if the first observation starts within [`backfill_threshold`] of the
///   first expected session, and omitted otherwise.
///
/// Bars for sessions outside `expected` are ignored. An empty `bars` yields
/// an empty result.
#[must_use]
pub fn fill_missing(expected: &[Session], bars: &[Bar]) -> Vec<FilledBar> {
    let by_session: HashMap<&Session, &Bar> = bars.iter().map(|b| (&b.session, b)).collect();

    let Some(first_idx) = expected.iter().position(|s| by_session.contains_key(s)) else {
        return Vec::new();
    };
    let first = by_session[&expected[first_idx]];
    let lead = first.session.start - expected[0].start;
    let backfill = lead <= backfill_threshold(first.interval);

    let mut out = Vec::with_capacity(expected.len());

    if backfill {
        for session in &expected[..first_idx] {
            out.push(FilledBar {
                bar: quiet_bar(first, session, first.open),
                synthetic: true,
            });
        }
    }

    let mut last_close = first.close;
    let mut template = first;
    for session in &expected[first_idx..] {
        match by_session.get(session) {
            Some(bar) => {
                last_close = bar.close;
                template = bar;
                out.push(FilledBar {
                    bar: (*bar).clone(),
                    synthetic: false,
                });
            }
            None => out.push(FilledBar {
                bar: quiet_bar(template, session, last_close),
                synthetic: true,
            }),
        }
    }

    out
}

fn quiet_bar(template: &Bar, session: &Session, price: f64) -> Bar {
    Bar {
        instrument: template.instrument.clone(),
        interval: template.interval,
        session: session.clone(),
        open: price,
        high: price,
        low: price,
        close: price,
        volume: 0.0,
        vwap: Some(0.0),
        transactions: Some(0),
        provenance: template.provenance,
    }
}

/// Combines `bars` into one bar of `interval` covering `session`.
///
/// Open comes from the earliest bar and close from the latest; high and low
/// are the extremes; volume and trade counts are summed; vwap is the
/// volume-weighted mean of the component vwaps when every component reports
/// one. Provenance is the most recent component provenance.
///
/// # Errors
/// Returns [`DataError::InvalidParameter`] if `bars` is empty, mixes
/// instruments, or contains a bar outside `session`.
pub fn aggregate(bars: &[Bar], interval: Interval, session: Session) -> Result<Bar> {
    let mut sorted: Vec<&Bar> = bars.iter().collect();
    sorted.sort_by_key(|b| b.session.start);

    let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
        return Err(DataError::InvalidParameter(
            "Cannot aggregate an empty set of bars".to_string(),
        ));
    };

    for bar in &sorted {
        if bar.instrument != first.instrument {
            return Err(DataError::InvalidParameter(format!(
                "Cannot aggregate {} with {}",
                first.instrument, bar.instrument
            )));
        }
        if bar.session.start < session.start || bar.session.end > session.end {
            return Err(DataError::InvalidParameter(format!(
                "Bar for {} lies outside target session {}",
                bar.session, session
            )));
        }
    }

    let volume: f64 = sorted.iter().map(|b| b.volume).sum();
    let vwap = if volume > 0.0 {
        sorted
            .iter()
            .map(|b| b.vwap.map(|v| v * b.volume))
            .sum::<Option<f64>>()
            .map(|notional| notional / volume)
    } else {
        None
    };

    Ok(Bar {
        instrument: first.instrument.clone(),
        interval,
        session,
        open: first.open,
        high: sorted.iter().map(|b| b.high).fold(f64::MIN, f64::max),
        low: sorted.iter().map(|b| b.low).fold(f64::MAX, f64::min),
        close: last.close,
        volume,
        vwap,
        transactions: sorted.iter().map(|b| b.transactions).sum(),
        provenance: sorted
            .iter()
            .map(|b| b.provenance)
            .max()
            .unwrap_or(first.provenance),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Instrument, Venue};
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};

    fn five_minute_sessions(n: usize) -> Vec<Session> {
        let date = NaiveDate::from_ymd_opt(2024, 3, 20).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 20, 13, 30, 0).unwrap();
        (0..n)
            .map(|i| {
                let start = base + TimeDelta::minutes(5 * i as i64);
                Session::new(Venue::new("XNYS"), date, start, start + TimeDelta::minutes(5)).unwrap()
            })
            .collect()
    }

    fn provenance() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 21, 0, 0, 0).unwrap()
    }

    // Mirrors a quiet-morning AAPL tape: (open, high, low, close, volume, vwap, trades).
    fn fixture() -> (Vec<Session>, Vec<Bar>) {
        let rows = [
            (150.20, 150.35, 150.15, 150.30, 1000.0, 150.25, 50),
            (150.45, 150.60, 150.40, 150.55, 1500.0, 150.50, 75),
            (150.45, 150.50, 150.30, 150.35, 800.0, 150.40, 40),
            (150.70, 150.85, 150.65, 150.80, 2000.0, 150.75, 100),
            (150.55, 150.70, 150.50, 150.65, 1200.0, 150.60, 60),
        ];
        let sessions = five_minute_sessions(rows.len());
        let bars = sessions
            .iter()
            .zip(rows)
            .map(|(s, (o, h, l, c, v, vw, n))| Bar {
                instrument: Instrument::new("AAPL", "XNYS"),
                interval: Interval::FiveMinute,
                session: s.clone(),
                open: o,
                high: h,
                low: l,
                close: c,
                volume: v,
                vwap: Some(vw),
                transactions: Some(n),
                provenance: provenance(),
            })
            .collect();
        (sessions, bars)
    }

    #[test]
    fn test_fill_complete_series_is_unchanged() {
        let (sessions, bars) = fixture();
        let filled = fill_missing(&sessions, &bars);
        assert_eq!(filled.len(), 5);
        assert!(filled.iter().all(|f| !f.synthetic));
        assert_eq!(filled[3].bar, bars[3]);
    }

    #[test]
    fn test_fill_trailing_gap_repeats_last_close() {
        let (sessions, mut bars) = fixture();
        bars.pop();
        let filled = fill_missing(&sessions, &bars);
        let last = &filled[4];
        assert!(last.synthetic);
        assert_eq!(last.bar.close, 150.80);
        assert_eq!(last.bar.open, 150.80);
        assert_eq!(last.bar.high, 150.80);
        assert_eq!(last.bar.low, 150.80);
        assert_eq!(last.bar.volume, 0.0);
        assert_eq!(last.bar.transactions, Some(0));
    }

    #[test]
    fn test_fill_leading_gap_uses_first_open() {
        let (sessions, mut bars) = fixture();
        bars.remove(0);
        let filled = fill_missing(&sessions, &bars);
        assert_eq!(filled.len(), 5);
        assert!(filled[0].synthetic);
        assert_eq!(filled[0].bar.close, 150.45);
        assert_eq!(filled[0].bar.low, 150.45);
    }

    #[test]
    fn test_fill_inner_gap_forward_fills() {
        let (sessions, mut bars) = fixture();
        bars.remove(2);
        let filled = fill_missing(&sessions, &bars);
        assert!(filled[2].synthetic);
        assert_eq!(filled[2].bar.close, 150.55);
        assert_eq!(filled[2].bar.vwap, Some(0.0));
    }

    #[test]
    fn test_fill_skips_distant_leading_sessions() {
        let sessions = five_minute_sessions(20);
        let (_, fixture_bars) = fixture();
        // First observation lands 75 minutes after the first expected session.
        let mut late = fixture_bars[0].clone();
        late.session = sessions[15].clone();
        let filled = fill_missing(&sessions, &[late]);
        assert_eq!(filled.len(), 5);
        assert!(!filled[0].synthetic);
    }

    #[test]
    fn test_aggregate_five_minutes_into_one_bar() {
        let (sessions, bars) = fixture();
        let target = Session::new(
            Venue::new("XNYS"),
            sessions[0].trading_date,
            sessions[0].start,
            sessions[4].end,
        )
        .unwrap();

        let agg = aggregate(&bars, Interval::ThirtyMinute, target.clone()).unwrap();
        assert_eq!(agg.session, target);
        assert_eq!(agg.open, 150.20);
        assert_eq!(agg.close, 150.65);
        assert_eq!(agg.high, 150.85);
        assert_eq!(agg.low, 150.15);
        assert_eq!(agg.volume, 6500.0);
        assert_eq!(agg.transactions, Some(325));
        let expected_vwap = (150.25 * 1000.0
            + 150.50 * 1500.0
            + 150.40 * 800.0
            + 150.75 * 2000.0
            + 150.60 * 1200.0)
            / 6500.0;
        assert!((agg.vwap.unwrap() - expected_vwap).abs() < 1e-9);
        assert!(agg.validate().is_ok());
    }

    #[test]
    fn test_aggregate_rejects_bars_outside_target() {
        let (sessions, bars) = fixture();
        let target = sessions[0].clone();
        assert!(aggregate(&bars, Interval::FiveMinute, target).is_err());
        assert!(aggregate(&[], Interval::FiveMinute, sessions[0].clone()).is_err());
    }
}
