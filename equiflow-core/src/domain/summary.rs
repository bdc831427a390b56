//! Per-symbol summary produced by the aggregator.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Summary statistics for one symbol over one pipeline run.
///
/// `None` means "undefined" (not enough observations, or the sub-aggregation
/// had no entry for this symbol). It is never a stand-in for zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub symbol: String,
    /// Mean close price over rows whose close parsed.
    pub average_price: Option<f64>,
    pub total_volume: u64,
    /// Mean daily return with missing returns counted as 0.
    pub mean_daily_return: Option<f64>,
    /// Sample standard deviation of the numeric daily returns.
    pub volatility: Option<f64>,
    /// Trailing 5-row close average at the last observation.
    pub moving_avg_5: Option<f64>,
    /// Trailing 10-row close average at the last observation.
    pub moving_avg_10: Option<f64>,
    pub max_date: Option<NaiveDate>,
    pub observations: usize,
}
