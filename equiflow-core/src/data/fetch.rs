//! Fetch orchestrator: one request per symbol, strictly sequential, with a
//! fixed pause between requests to stay under the provider's quota.

use std::time::Duration;

use super::provider::{DataError, FetchProgress, MarketDataProvider, SymbolSpec};
use crate::domain::RawBatch;

/// Fetch every symbol of the universe.
///
/// A failing symbol is recorded and skipped. When the provider stops being
/// available (circuit breaker) the remaining symbols are failed without a
/// request.
pub fn fetch_universe(
    provider: &dyn MarketDataProvider,
    symbols: &[SymbolSpec],
    delay: Duration,
    progress: &dyn FetchProgress,
) -> FetchSummary {
    let total = symbols.len();
    let mut batches = Vec::new();
    let mut errors: Vec<(String, DataError)> = Vec::new();

    for (i, spec) in symbols.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tracing::info!(secs = delay.as_secs_f64(), "waiting between requests");
            std::thread::sleep(delay);
        }

        progress.on_start(&spec.symbol, i, total);
        match provider.fetch_daily(spec) {
            Ok(batch) => {
                progress.on_complete(&spec.symbol, i, total, Ok(batch.len()));
                batches.push(batch);
            }
            Err(e) => {
                progress.on_complete(&spec.symbol, i, total, Err(&e));
                errors.push((spec.symbol.clone(), e));
            }
        }

        if !provider.is_available() {
            for rest in &symbols[(i + 1)..] {
                errors.push((rest.symbol.clone(), DataError::CircuitBreakerTripped));
            }
            break;
        }
    }

    progress.on_batch_complete(batches.len(), errors.len(), total);

    FetchSummary {
        total,
        batches,
        errors,
    }
}

/// Outcome of a universe fetch.
#[derive(Debug)]
pub struct FetchSummary {
    pub total: usize,
    pub batches: Vec<RawBatch>,
    pub errors: Vec<(String, DataError)>,
}

impl FetchSummary {
    pub fn succeeded(&self) -> usize {
        self.batches.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    /// Rows across all fetched batches.
    pub fn total_rows(&self) -> usize {
        self.batches.iter().map(RawBatch::len).sum()
    }
}
