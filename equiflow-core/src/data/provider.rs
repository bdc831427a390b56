//! Market data provider trait and structured error types.
//!
//! The MarketDataProvider trait abstracts over the upstream price API so the
//! pipeline can be driven from a live source, from CSV files, or from a mock
//! in tests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::RawBatch;

/// One entry of the symbol universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: String,
    #[serde(default)]
    pub company_name: String,
}

impl SymbolSpec {
    pub fn new(symbol: impl Into<String>, company_name: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            company_name: company_name.into(),
        }
    }
}

/// Structured error types for fetch operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by provider: {0}")]
    RateLimited(String),

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("hard stop: data provider has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("failed to read raw file {path}: {reason}")]
    RawFile { path: String, reason: String },

    #[error("data error: {0}")]
    Other(String),
}

/// A source of raw daily price batches.
///
/// Implementations return one batch per symbol, tagged with the symbol and
/// company name so downstream stages never have to look them up again.
pub trait MarketDataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch the daily series for one symbol.
    fn fetch_daily(&self, spec: &SymbolSpec) -> Result<RawBatch, DataError>;

    /// Check if the provider is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}

/// Progress callback for multi-symbol fetches.
pub trait FetchProgress {
    fn on_start(&self, symbol: &str, index: usize, total: usize);

    fn on_complete(&self, symbol: &str, index: usize, total: usize, result: Result<usize, &DataError>);

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Progress reporter that emits `tracing` events.
pub struct LogProgress;

impl FetchProgress for LogProgress {
    fn on_start(&self, symbol: &str, index: usize, total: usize) {
        tracing::info!(symbol, "[{}/{}] fetching", index + 1, total);
    }

    fn on_complete(&self, symbol: &str, _index: usize, _total: usize, result: Result<usize, &DataError>) {
        match result {
            Ok(rows) => tracing::info!(symbol, rows, "extracted"),
            Err(e) => tracing::error!(symbol, error = %e, "fetch failed"),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        tracing::info!(succeeded, failed, total, "fetch complete");
    }
}

/// Progress reporter that stays silent.
pub struct NoProgress;

impl FetchProgress for NoProgress {
    fn on_start(&self, _symbol: &str, _index: usize, _total: usize) {}

    fn on_complete(&self, _symbol: &str, _index: usize, _total: usize, _result: Result<usize, &DataError>) {}

    fn on_batch_complete(&self, _succeeded: usize, _failed: usize, _total: usize) {}
}
