//! Return calculator: record-to-record close returns within each symbol.

use crate::domain::{NormalizedRecord, ReturnRecord};

/// Attach a daily return to every record.
///
/// `records` must be sorted by (symbol, date), as the normalizer emits them.
/// The return compares each close with the last *present* close of the same
/// symbol; a missing close is padded with that value, so its own return is
/// 0.0 and the next present close still measures against a real price.
/// Rows before the symbol's first present close have no return. Calendar
/// gaps are not filled. Single pass, O(n).
pub fn compute_returns(records: Vec<NormalizedRecord>) -> Vec<ReturnRecord> {
    let mut out = Vec::with_capacity(records.len());
    let mut symbol: Option<String> = None;
    let mut last_close: Option<f64> = None;

    for record in records {
        if symbol.as_deref() != Some(record.symbol.as_str()) {
            symbol = Some(record.symbol.clone());
            last_close = None;
        }
        let close = record.close.or(last_close);
        let daily_return = pct_change(last_close, close);
        last_close = close;
        out.push(ReturnRecord {
            record,
            daily_return,
        });
    }

    out
}

/// Fractional change from `prev` to `current`.
///
/// `None` if either value is missing or `prev` is zero.
pub fn pct_change(prev: Option<f64>, current: Option<f64>) -> Option<f64> {
    match (prev, current) {
        (Some(p), Some(c)) if p > 0.0 => Some(c / p - 1.0),
        _ => None,
    }
}
