//! Alpha Vantage data provider.
//!
//! Fetches `TIME_SERIES_DAILY` from the Alpha Vantage query API and lays the
//! series out as a raw batch. Values are passed through as the strings the
//! API returns; typing is the normalizer's job.
//!
//! The API reports throttling and bad symbols with HTTP 200 and a JSON body
//! (`Note`, `Information`, `Error Message`), so those are mapped here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataError, MarketDataProvider, SymbolSpec};
use crate::domain::RawBatch;

pub const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co/query";

/// Column layout of every batch this provider returns.
pub const RAW_HEADERS: [&str; 8] = [
    "date",
    "open",
    "high",
    "low",
    "close",
    "volume",
    "symbol",
    "company_name",
];

#[derive(Debug, Deserialize)]
struct DailyResponse {
    #[serde(rename = "Time Series (Daily)")]
    time_series: Option<BTreeMap<String, DailyBar>>,
    #[serde(rename = "Error Message")]
    error_message: Option<String>,
    #[serde(rename = "Note")]
    note: Option<String>,
    #[serde(rename = "Information")]
    information: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DailyBar {
    #[serde(rename = "1. open", default)]
    open: String,
    #[serde(rename = "2. high", default)]
    high: String,
    #[serde(rename = "3. low", default)]
    low: String,
    #[serde(rename = "4. close", default)]
    close: String,
    #[serde(rename = "5. volume", default)]
    volume: String,
}

/// `outputsize` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSize {
    /// Latest 100 points.
    #[default]
    Compact,
    /// Full history.
    Full,
}

impl OutputSize {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputSize::Compact => "compact",
            OutputSize::Full => "full",
        }
    }
}

/// Connection settings for [`AlphaVantageProvider`].
#[derive(Debug, Clone)]
pub struct AlphaVantageSettings {
    pub base_url: String,
    pub api_key: String,
    pub output_size: OutputSize,
    pub timeout: Duration,
}

impl Default for AlphaVantageSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            output_size: OutputSize::Compact,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct AlphaVantageProvider {
    client: reqwest::blocking::Client,
    settings: AlphaVantageSettings,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl AlphaVantageProvider {
    pub fn new(
        settings: AlphaVantageSettings,
        circuit_breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            settings,
            circuit_breaker,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    fn query(&self, symbol: &str) -> [(&'static str, String); 5] {
        [
            ("function", "TIME_SERIES_DAILY".to_string()),
            ("symbol", symbol.to_string()),
            ("apikey", self.settings.api_key.clone()),
            ("datatype", "json".to_string()),
            ("outputsize", self.settings.output_size.as_str().to_string()),
        ]
    }

    /// Execute the request with retry and circuit breaker logic.
    fn fetch_with_retry(&self, spec: &SymbolSpec) -> Result<RawBatch, DataError> {
        if self.settings.api_key.trim().is_empty() {
            return Err(DataError::AuthenticationRequired(
                "no Alpha Vantage API key configured".into(),
            ));
        }
        if !self.circuit_breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let query = self.query(&spec.symbol);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                tracing::debug!(symbol = %spec.symbol, attempt, ?delay, "retrying");
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(DataError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(&self.settings.base_url).query(&query).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(DataError::CircuitBreakerTripped);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                last_error = Some(DataError::RateLimited(format!("HTTP {status}")));
                continue;
            }
            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(DataError::Other(format!("HTTP {status} for {}", spec.symbol)));
                continue;
            }

            let body = resp.text().map_err(|e| {
                DataError::ResponseFormatChanged(format!(
                    "failed to read response for {}: {e}",
                    spec.symbol
                ))
            })?;

            match parse_daily_response(spec, &body) {
                Ok(batch) => {
                    self.circuit_breaker.record_success();
                    return Ok(batch);
                }
                Err(e @ DataError::RateLimited(_)) => {
                    self.circuit_breaker.record_failure();
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

impl MarketDataProvider for AlphaVantageProvider {
    fn name(&self) -> &str {
        "alpha_vantage"
    }

    fn fetch_daily(&self, spec: &SymbolSpec) -> Result<RawBatch, DataError> {
        self.fetch_with_retry(spec)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

/// Parse a `TIME_SERIES_DAILY` JSON body into a raw batch, oldest date first.
pub fn parse_daily_response(spec: &SymbolSpec, body: &str) -> Result<RawBatch, DataError> {
    let resp: DailyResponse = serde_json::from_str(body).map_err(|e| {
        DataError::ResponseFormatChanged(format!("invalid JSON for {}: {e}", spec.symbol))
    })?;

    let series = match resp.time_series {
        Some(series) => series,
        None => {
            if let Some(msg) = resp.error_message {
                return Err(if msg.contains("Invalid API call") {
                    DataError::SymbolNotFound {
                        symbol: spec.symbol.clone(),
                    }
                } else {
                    DataError::ResponseFormatChanged(msg)
                });
            }
            if let Some(msg) = resp.note.or(resp.information) {
                return Err(DataError::RateLimited(msg));
            }
            return Err(DataError::ResponseFormatChanged(format!(
                "no daily series in response for {}",
                spec.symbol
            )));
        }
    };

    let mut batch = RawBatch::new(
        spec.symbol.clone(),
        RAW_HEADERS.iter().map(|h| h.to_string()).collect(),
    );
    for (date, bar) in series {
        batch.push_row(vec![
            date,
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            spec.symbol.clone(),
            spec.company_name.clone(),
        ]);
    }

    if batch.is_empty() {
        return Err(DataError::SymbolNotFound {
            symbol: spec.symbol.clone(),
        });
    }
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = r#"{
        "Meta Data": {"2. Symbol": "AAPL"},
        "Time Series (Daily)": {
            "2024-01-03": {"1. open": "101.0", "2. high": "112.0", "3. low": "100.5", "4. close": "110.0", "5. volume": "2000"},
            "2024-01-02": {"1. open": "99.0", "2. high": "101.0", "3. low": "98.0", "4. close": "100.0", "5. volume": "1000"}
        }
    }"#;

    fn aapl() -> SymbolSpec {
        SymbolSpec::new("AAPL", "Apple Inc.")
    }

    #[test]
    fn parses_series_oldest_first() {
        let batch = parse_daily_response(&aapl(), BODY).unwrap();
        assert_eq!(batch.label, "AAPL");
        assert_eq!(batch.headers, RAW_HEADERS.to_vec());
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.rows[0][0], "2024-01-02");
        assert_eq!(batch.rows[1][4], "110.0");
        assert_eq!(batch.rows[1][7], "Apple Inc.");
    }

    #[test]
    fn missing_fields_pass_through_as_empty() {
        let body = r#"{"Time Series (Daily)": {"2024-01-02": {"4. close": "1.0"}}}"#;
        let batch = parse_daily_response(&aapl(), body).unwrap();
        assert_eq!(batch.rows[0][1], "");
        assert_eq!(batch.rows[0][4], "1.0");
    }

    #[test]
    fn throttle_note_is_rate_limited() {
        let body = r#"{"Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."}"#;
        let err = parse_daily_response(&aapl(), body).unwrap_err();
        assert!(matches!(err, DataError::RateLimited(_)));

        let body = r#"{"Information": "rate limit"}"#;
        let err = parse_daily_response(&aapl(), body).unwrap_err();
        assert!(matches!(err, DataError::RateLimited(_)));
    }

    #[test]
    fn invalid_api_call_is_symbol_not_found() {
        let body = r#"{"Error Message": "Invalid API call. Please retry or visit the documentation."}"#;
        let err = parse_daily_response(&aapl(), body).unwrap_err();
        assert!(matches!(err, DataError::SymbolNotFound { ref symbol } if symbol == "AAPL"));
    }

    #[test]
    fn unexpected_payloads_are_format_changes() {
        for body in ["{}", "not json", r#"{"Time Series (Daily)": 3}"#] {
            let err = parse_daily_response(&aapl(), body).unwrap_err();
            assert!(matches!(err, DataError::ResponseFormatChanged(_)), "{body}");
        }
    }

    #[test]
    fn empty_series_is_symbol_not_found() {
        let body = r#"{"Time Series (Daily)": {}}"#;
        let err = parse_daily_response(&aapl(), body).unwrap_err();
        assert!(matches!(err, DataError::SymbolNotFound { .. }));
    }

    #[test]
    fn missing_api_key_fails_before_any_request() {
        let provider = AlphaVantageProvider::new(
            AlphaVantageSettings::default(),
            Arc::new(CircuitBreaker::default_provider()),
        )
        .unwrap();
        let err = provider.fetch_daily(&aapl()).unwrap_err();
        assert!(matches!(err, DataError::AuthenticationRequired(_)));
    }
}
