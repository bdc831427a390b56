//! Aggregator: per-symbol summary statistics.
//!
//! Four independent sub-aggregations are computed over the same grouped input
//! and then merged, anchored on the symbols of the first one:
//! 1. price/volume/return means
//! 2. volatility
//! 3. trailing moving averages
//! 4. latest date
//!
//! A symbol absent from a later sub-aggregation keeps its row with those
//! fields undefined.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::domain::{ReturnRecord, SymbolSummary};

/// Window lengths of the trailing averages reported per symbol.
pub const SHORT_WINDOW: usize = 5;
pub const LONG_WINDOW: usize = 10;

/// Price, volume and mean-return statistics for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceStats {
    pub average_price: Option<f64>,
    pub total_volume: u64,
    pub mean_daily_return: f64,
    pub observations: usize,
}

/// Trailing close averages evaluated at the last observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingAverages {
    pub short: Option<f64>,
    pub long: Option<f64>,
}

/// Produce exactly one summary per symbol present in `records`.
///
/// Output is ordered by symbol.
pub fn aggregate(records: &[ReturnRecord]) -> Vec<SymbolSummary> {
    let groups = group_by_symbol(records);

    let performance: BTreeMap<&str, PerformanceStats> = groups
        .iter()
        .map(|(symbol, rows)| (*symbol, performance_stats(rows)))
        .collect();
    let volatilities: BTreeMap<&str, Option<f64>> = groups
        .iter()
        .map(|(symbol, rows)| (*symbol, volatility(rows)))
        .collect();
    let averages: BTreeMap<&str, TrailingAverages> = groups
        .iter()
        .map(|(symbol, rows)| (*symbol, trailing_averages(rows)))
        .collect();
    let max_dates: BTreeMap<&str, NaiveDate> = groups
        .iter()
        .filter_map(|(symbol, rows)| max_date(rows).map(|d| (*symbol, d)))
        .collect();

    performance
        .into_iter()
        .map(|(symbol, perf)| {
            let avg = averages.get(symbol);
            SymbolSummary {
                symbol: symbol.to_string(),
                average_price: perf.average_price,
                total_volume: perf.total_volume,
                mean_daily_return: Some(perf.mean_daily_return),
                volatility: volatilities.get(symbol).copied().flatten(),
                moving_avg_5: avg.and_then(|a| a.short),
                moving_avg_10: avg.and_then(|a| a.long),
                max_date: max_dates.get(symbol).copied(),
                observations: perf.observations,
            }
        })
        .collect()
}

/// Group rows by symbol, each group in chronological order.
fn group_by_symbol(records: &[ReturnRecord]) -> BTreeMap<&str, Vec<&ReturnRecord>> {
    let mut groups: BTreeMap<&str, Vec<&ReturnRecord>> = BTreeMap::new();
    for r in records {
        groups.entry(r.record.symbol.as_str()).or_default().push(r);
    }
    for rows in groups.values_mut() {
        rows.sort_by_key(|r| r.record.date);
    }
    groups
}

// ─── Sub-aggregations ───────────────────────────────────────────────

/// Mean close, summed volume and mean return (missing returns count as 0).
pub fn performance_stats(rows: &[&ReturnRecord]) -> PerformanceStats {
    let closes: Vec<f64> = rows.iter().filter_map(|r| r.record.close).collect();
    let total_volume = rows
        .iter()
        .filter_map(|r| r.record.volume)
        .fold(0u64, |acc, v| acc.saturating_add(v));
    let returns: Vec<f64> = rows.iter().map(|r| r.daily_return.unwrap_or(0.0)).collect();

    PerformanceStats {
        average_price: mean_f64(&closes),
        total_volume,
        mean_daily_return: mean_f64(&returns).unwrap_or(0.0),
        observations: rows.len(),
    }
}

/// Sample standard deviation of the numeric returns; undefined below two.
pub fn volatility(rows: &[&ReturnRecord]) -> Option<f64> {
    let returns: Vec<f64> = rows.iter().filter_map(|r| r.daily_return).collect();
    sample_std_dev(&returns)
}

/// Close averages over the last 5 and last 10 rows.
pub fn trailing_averages(rows: &[&ReturnRecord]) -> TrailingAverages {
    let closes: Vec<Option<f64>> = rows.iter().map(|r| r.record.close).collect();
    TrailingAverages {
        short: trailing_mean(&closes, SHORT_WINDOW),
        long: trailing_mean(&closes, LONG_WINDOW),
    }
}

/// Latest date among the rows.
pub fn max_date(rows: &[&ReturnRecord]) -> Option<NaiveDate> {
    rows.iter().map(|r| r.record.date).max()
}

// ─── Statistics helpers ─────────────────────────────────────────────

/// Arithmetic mean; `None` for an empty slice.
pub fn mean_f64(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n - 1 denominator); `None` below two values.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean = mean_f64(values)?;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Mean of exactly the last `window` values.
///
/// `None` if there are fewer than `window` values or any of the last
/// `window` is missing.
pub fn trailing_mean(values: &[Option<f64>], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    let present: Vec<f64> = tail.iter().copied().collect::<Option<Vec<f64>>>()?;
    mean_f64(&present)
}
