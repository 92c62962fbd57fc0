#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/barsync/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Polygon.io data provider.
//!
//! This crate provides a Polygon.io aggregates provider that implements the
//! [`BarProvider`] trait from `barsync-core`.
//!
//! # Example
//!
//! ```no_run
//! use barsync_polygon::PolygonProvider;
//! use barsync_core::{BarProvider, Instrument, Interval};
//! use chrono::{TimeZone, Utc};
//!
//! # async fn example() -> barsync_core::Result<()> {
//! let provider = PolygonProvider::from_env()?;
//! let acme = Instrument::new("ACME", "XNYS");
//! let start = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
//! let end = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
//!
//! let bars = provider.fetch_bars(&acme, Interval::Daily, start, end).await?;
//! println!("Fetched {} bars", bars.len());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use barsync_core::{BarProvider, DataError, Instrument, Interval, RawBar, Result};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Polygon.io REST base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "POLYGON_API_KEY";

/// Largest page Polygon serves for aggregates.
const PAGE_LIMIT: u32 = 50_000;

/// Upper bound on followed `next_url` links per request.
const MAX_PAGES: usize = 100;

const PROVIDER_NAME: &str = "Polygon";

/// Polygon.io aggregates provider.
///
/// Authenticates with a bearer token, so the key never appears in URLs or
/// logs. `Debug` output redacts it.
#[derive(Clone)]
pub struct PolygonProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl fmt::Debug for PolygonProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolygonProvider")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl PolygonProvider {
    /// Create a provider with a default HTTP client (30 s request timeout).
    ///
    /// # Errors
    /// Returns [`DataError::Config`] if the key is empty or the HTTP client
    /// cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| DataError::Config(format!("Failed to create HTTP client: {e}")))?;
        Self::with_client(api_key, client)
    }

    /// Create a provider from the `POLYGON_API_KEY` environment variable.
    ///
    /// # Errors
    /// Returns [`DataError::Config`] if the variable is unset or empty.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(API_KEY_ENV)
            .map_err(|_| DataError::Config(format!("{API_KEY_ENV} is not set")))?;
        Self::new(key)
    }

    /// Create a provider with a custom HTTP client.
    ///
    /// # Errors
    /// Returns [`DataError::Config`] if the key is empty.
    pub fn with_client(api_key: impl Into<String>, client: reqwest::Client) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(DataError::Config("Polygon API key is empty".to_string()));
        }
        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Point the provider at another host (proxies, test servers).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Build the first-page aggregates URL.
    fn build_aggs_url(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> String {
        let (multiplier, timespan) = timespan(interval);
        format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit={}",
            self.base_url,
            instrument.symbol.as_str(),
            multiplier,
            timespan,
            start.timestamp_millis(),
            end.timestamp_millis(),
            PAGE_LIMIT
        )
    }

    /// Fetch and decode one page.
    async fn fetch_page(&self, url: &str, instrument: &Instrument) -> Result<AggsResponse> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| DataError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, instrument, &body));
        }

        response
            .json::<AggsResponse>()
            .await
            .map_err(|e| DataError::Parse(e.to_string()))
    }
}

/// Polygon `(multiplier, timespan)` for an interval.
const fn timespan(interval: Interval) -> (u32, &'static str) {
    match interval {
        Interval::Minute => (1, "minute"),
        Interval::FiveMinute => (5, "minute"),
        Interval::FifteenMinute => (15, "minute"),
        Interval::ThirtyMinute => (30, "minute"),
        // Hour buckets start on the hour; venues opening at :30 need halves.
        Interval::Hourly => (30, "minute"),
        Interval::Daily => (1, "day"),
    }
}

/// Maps a failed HTTP status to a classified provider error.
fn classify_status(status: StatusCode, instrument: &Instrument, body: &str) -> DataError {
    let detail = error_message(body).unwrap_or_else(|| status.to_string());
    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            DataError::transient(PROVIDER_NAME, format!("throttled: {detail}"))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DataError::permanent(PROVIDER_NAME, format!("not authorized: {detail}"))
        }
        StatusCode::NOT_FOUND => {
            DataError::permanent(PROVIDER_NAME, format!("unknown ticker {instrument}: {detail}"))
        }
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            DataError::transient(PROVIDER_NAME, format!("HTTP {s}: {detail}"))
        }
        s => DataError::permanent(PROVIDER_NAME, format!("HTTP {s}: {detail}")),
    }
}

/// Extracts `error` or `message` from a Polygon error body.
fn error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<String>,
        message: Option<String>,
    }
    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    parsed.error.or(parsed.message)
}

#[async_trait]
impl BarProvider for PolygonProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn supported_intervals(&self) -> &[Interval] {
        &Interval::ALL
    }

    fn raw_interval(&self, interval: Interval) -> Interval {
        match interval {
            Interval::Hourly => Interval::ThirtyMinute,
            other => other,
        }
    }

    #[instrument(skip(self), fields(instrument = %instrument, interval = %interval))]
    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RawBar>> {
        if start > end {
            return Err(DataError::InvalidParameter(format!(
                "Start {start} is after end {end}"
            )));
        }

        let mut url = self.build_aggs_url(instrument, interval, start, end);
        let mut bars = Vec::new();
        for page in 0..MAX_PAGES {
            debug!(page, "Fetching aggregates page");
            let response = self.fetch_page(&url, instrument).await?;
            if response.status.eq_ignore_ascii_case("ERROR") {
                let message = response
                    .error
                    .unwrap_or_else(|| "unspecified error".to_string());
                return Err(DataError::permanent(PROVIDER_NAME, message));
            }

            bars.extend(response.results.into_iter().filter_map(Agg::into_raw_bar));

            match response.next_url {
                Some(next) if !next.is_empty() => url = next,
                _ => return Ok(bars),
            }
        }

        warn!(pages = MAX_PAGES, "Stopped following aggregate pagination");
        Ok(bars)
    }
}

// ============================================================================
// Polygon API Response Types
// ============================================================================

/// Aggregates endpoint response.
#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<Agg>,
    next_url: Option<String>,
    error: Option<String>,
}

/// One aggregate bar.
#[derive(Debug, Deserialize)]
struct Agg {
    /// Bar start, Unix milliseconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
    vw: Option<f64>,
    n: Option<u64>,
}

impl Agg {
    fn into_raw_bar(self) -> Option<RawBar> {
        let Some(timestamp) = DateTime::from_timestamp_millis(self.t) else {
            warn!(t = self.t, "Skipping aggregate with out-of-range timestamp");
            return None;
        };
        Some(RawBar {
            timestamp,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
            vwap: self.vw,
            transactions: self.n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provider() -> PolygonProvider {
        PolygonProvider::new("test-key").unwrap()
    }

    #[test]
    fn test_build_aggs_url() {
        let provider = provider().with_base_url("http://localhost:8080/");
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 1, 2, 21, 0, 0).unwrap();

        let url = provider.build_aggs_url(
            &Instrument::new("acme", "XNYS"),
            Interval::FifteenMinute,
            start,
            end,
        );

        assert_eq!(
            url,
            "http://localhost:8080/v2/aggs/ticker/ACME/range/15/minute/1704205800000/1704229200000\
             ?adjusted=true&sort=asc&limit=50000"
        );
    }

    #[test]
    fn test_daily_timespan() {
        assert_eq!(timespan(Interval::Daily), (1, "day"));
        assert_eq!(timespan(Interval::Hourly), (30, "minute"));
    }

    #[test]
    fn test_hourly_served_as_half_hours() {
        let provider = PolygonProvider::new("test-key").unwrap();
        assert_eq!(
            provider.raw_interval(Interval::Hourly),
            Interval::ThirtyMinute
        );
        assert_eq!(provider.raw_interval(Interval::Daily), Interval::Daily);
        assert_eq!(
            timespan(provider.raw_interval(Interval::Hourly)),
            timespan(Interval::Hourly)
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", PolygonProvider::new("super-secret").unwrap());
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(
            PolygonProvider::new("  "),
            Err(DataError::Config(_))
        ));
    }

    #[test]
    fn test_provider_info() {
        let provider = provider();
        assert_eq!(provider.name(), "Polygon");
        assert!(provider.supported_intervals().contains(&Interval::Daily));
    }

    #[test]
    fn test_parse_aggs_response() {
        let body = r#"{
            "ticker": "ACME",
            "queryCount": 2,
            "resultsCount": 2,
            "adjusted": true,
            "results": [
                {"v": 70790813, "vw": 131.6292, "o": 130.465, "c": 131.79, "h": 133.41, "l": 129.89, "t": 1704171600000, "n": 645365},
                {"v": 63896180.0, "o": 131.0, "c": 130.5, "h": 132.0, "l": 129.5, "t": 1704258000000}
            ],
            "status": "OK",
            "request_id": "6a7e466379af0a71039d60cc78e72282",
            "next_url": "https://api.polygon.io/v2/aggs/ticker/ACME/range/1/day/1704344400000/1706745599000?cursor=abc"
        }"#;

        let response: AggsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.status, "OK");
        assert!(response.next_url.is_some());

        let bars: Vec<RawBar> = response
            .results
            .into_iter()
            .filter_map(Agg::into_raw_bar)
            .collect();
        assert_eq!(bars.len(), 2);
        assert_eq!(
            bars[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 2, 5, 0, 0).unwrap()
        );
        assert_eq!(bars[0].transactions, Some(645_365));
        assert_eq!(bars[1].vwap, None);
        assert_eq!(bars[1].transactions, None);
    }

    #[test]
    fn test_parse_empty_response() {
        let body = r#"{"ticker": "NOPE", "queryCount": 0, "resultsCount": 0, "status": "OK"}"#;
        let response: AggsResponse = serde_json::from_str(body).unwrap();
        assert!(response.results.is_empty());
        assert!(response.next_url.is_none());
    }

    #[test]
    fn test_classify_status() {
        let acme = Instrument::new("ACME", "XNYS");

        let throttled = classify_status(StatusCode::TOO_MANY_REQUESTS, &acme, "");
        assert!(throttled.is_retryable());

        let unauthorized = classify_status(
            StatusCode::UNAUTHORIZED,
            &acme,
            r#"{"status":"ERROR","error":"Unknown API Key"}"#,
        );
        assert!(!unauthorized.is_retryable());
        assert!(unauthorized.to_string().contains("Unknown API Key"));

        assert!(!classify_status(StatusCode::NOT_FOUND, &acme, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, &acme, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, &acme, "").is_retryable());
    }
}
