//! Conversion of bar series into polars DataFrames.

use polars::prelude::*;

use crate::{
    error::{DataError, Result},
    types::Bar,
};

/// Builds a DataFrame with one row per bar.
///
/// Columns: `symbol`, `venue`, `interval`, `session_start`, `session_end`
/// (millisecond UTC datetimes), `open`, `high`, `low`, `close`, `volume`,
/// `vwap`, `transactions`.
///
/// # Errors
/// Returns [`DataError::Parse`] if polars rejects the columns.
pub fn bars_to_dataframe(bars: &[Bar]) -> Result<DataFrame> {
    let symbols: Vec<&str> = bars.iter().map(|b| b.instrument.symbol.as_str()).collect();
    let venues: Vec<&str> = bars.iter().map(|b| b.instrument.venue.as_str()).collect();
    let intervals: Vec<&str> = bars.iter().map(|b| b.interval.code()).collect();
    let starts: Vec<i64> = bars
        .iter()
        .map(|b| b.session.start.timestamp_millis())
        .collect();
    let ends: Vec<i64> = bars
        .iter()
        .map(|b| b.session.end.timestamp_millis())
        .collect();

    let datetime = DataType::Datetime(TimeUnit::Milliseconds, None);
    let start_col = Column::new("session_start".into(), starts)
        .cast(&datetime)
        .map_err(|e| DataError::Parse(e.to_string()))?;
    let end_col = Column::new("session_end".into(), ends)
        .cast(&datetime)
        .map_err(|e| DataError::Parse(e.to_string()))?;

    DataFrame::new(vec![
        Column::new("symbol".into(), symbols),
        Column::new("venue".into(), venues),
        Column::new("interval".into(), intervals),
        start_col,
        end_col,
        Column::new(
            "open".into(),
            bars.iter().map(|b| b.open).collect::<Vec<f64>>(),
        ),
        Column::new(
            "high".into(),
            bars.iter().map(|b| b.high).collect::<Vec<f64>>(),
        ),
        Column::new(
            "low".into(),
            bars.iter().map(|b| b.low).collect::<Vec<f64>>(),
        ),
        Column::new(
            "close".into(),
            bars.iter().map(|b| b.close).collect::<Vec<f64>>(),
        ),
        Column::new(
            "volume".into(),
            bars.iter().map(|b| b.volume).collect::<Vec<f64>>(),
        ),
        Column::new(
            "vwap".into(),
            bars.iter().map(|b| b.vwap).collect::<Vec<Option<f64>>>(),
        ),
        Column::new(
            "transactions".into(),
            bars.iter()
                .map(|b| b.transactions)
                .collect::<Vec<Option<u64>>>(),
        ),
    ])
    .map_err(|e| DataError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::Interval;
    use crate::types::{Instrument, Session, Venue};
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn test_dataframe_shape() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap();
        let session = Session::new(
            Venue::new("XNYS"),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            start,
            end,
        )
        .unwrap();
        let bar = Bar {
            instrument: Instrument::new("ACME", "XNYS"),
            interval: Interval::Daily,
            session,
            open: 10.0,
            high: 11.0,
            low: 9.5,
            close: 10.5,
            volume: 1_000.0,
            vwap: None,
            transactions: Some(12),
            provenance: end,
        };

        let df = bars_to_dataframe(&[bar.clone(), bar]).unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 12);
        assert_eq!(
            df.column("close").unwrap().f64().unwrap().get(0),
            Some(10.5)
        );
    }

    #[test]
    fn test_empty_series() {
        let df = bars_to_dataframe(&[]).unwrap();
        assert_eq!(df.height(), 0);
    }
}
