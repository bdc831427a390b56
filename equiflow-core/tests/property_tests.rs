//! Property tests for transform invariants.
//!
//! Uses proptest to verify:
//! 1. Normalized output: uppercase symbols, ISO dates, unique sorted keys
//! 2. Return chain: only rows before a symbol's first present close lack a return
//! 3. Volatility: undefined below two numeric returns, non-negative otherwise
//! 4. Moving averages: present only at full windows, equal to the tail mean

use proptest::prelude::*;

use equiflow_core::analytics::{aggregate, compute_returns, LONG_WINDOW, SHORT_WINDOW};
use equiflow_core::data::Normalizer;
use equiflow_core::domain::RawBatch;

const HEADERS: [&str; 7] = ["Date", "Symbol", "Open", "High", "Low", "Close", "Volume"];

// ── Strategies (proptest) ────────────────────────────────────────────

fn arb_symbol() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["aapl", "MSFT", " Goog ", "amzn", "NfLx"]).prop_map(String::from)
}

fn arb_date() -> impl Strategy<Value = String> {
    (2020i32..2025, 1u32..13, 1u32..29, 0usize..3).prop_map(|(y, m, d, fmt)| match fmt {
        0 => format!("{y:04}-{m:02}-{d:02}"),
        1 => format!("{y:04}/{m:02}/{d:02}"),
        _ => format!("{m:02}/{d:02}/{y:04}"),
    })
}

fn arb_price_cell() -> impl Strategy<Value = String> {
    prop_oneof![
        8 => (1.0..500.0_f64).prop_map(|p| format!("{:.2}", p)),
        1 => Just(String::new()),
        1 => Just("n/a".to_string()),
    ]
}

fn arb_row() -> impl Strategy<Value = Vec<String>> {
    (arb_date(), arb_symbol(), arb_price_cell(), 0u64..5_000_000).prop_map(
        |(date, symbol, close, volume)| {
            vec![
                date,
                symbol,
                close.clone(),
                close.clone(),
                close.clone(),
                close,
                volume.to_string(),
            ]
        },
    )
}

fn arb_batch() -> impl Strategy<Value = RawBatch> {
    prop::collection::vec(arb_row(), 0..60).prop_map(|rows| {
        let mut batch = RawBatch::new("prop", HEADERS.iter().map(|h| h.to_string()).collect());
        for row in rows {
            batch.push_row(row);
        }
        batch
    })
}

fn arb_closes() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(1.0..500.0_f64, 1..25)
}

fn series_batch(closes: &[f64]) -> RawBatch {
    let base = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let mut batch = RawBatch::new("series", HEADERS.iter().map(|h| h.to_string()).collect());
    for (i, c) in closes.iter().enumerate() {
        let date = base + chrono::Duration::days(i as i64);
        let c = format!("{c}");
        batch.push_row(vec![
            date.format("%Y-%m-%d").to_string(),
            "X".into(),
            c.clone(),
            c.clone(),
            c.clone(),
            c,
            "100".into(),
        ]);
    }
    batch
}

// ── 1. Normalized output ─────────────────────────────────────────────

proptest! {
    #[test]
    fn normalized_symbols_are_uppercase_and_dates_iso(batch in arb_batch()) {
        let normalized = Normalizer::normalize(&[batch]).unwrap();
        for r in &normalized.records {
            prop_assert_eq!(r.symbol.clone(), r.symbol.trim().to_uppercase());
            let iso = r.iso_date();
            prop_assert_eq!(iso.len(), 10);
            prop_assert_eq!(&iso[4..5], "-");
            prop_assert_eq!(&iso[7..8], "-");
        }
    }

    #[test]
    fn normalized_keys_are_unique_and_sorted(batch in arb_batch()) {
        let normalized = Normalizer::normalize(&[batch]).unwrap();
        for w in normalized.records.windows(2) {
            prop_assert!((&w[0].symbol, w[0].date) < (&w[1].symbol, w[1].date));
        }
        let report = &normalized.report;
        prop_assert_eq!(
            report.input_rows,
            report.output_rows + report.dropped_rows() + report.duplicates_collapsed
        );
    }
}

// ── 2. Return chain ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn every_row_after_the_first_present_close_has_a_return(batch in arb_batch()) {
        let normalized = Normalizer::normalize(&[batch]).unwrap();
        let returns = compute_returns(normalized.records);
        let mut seen_close = false;
        for (i, r) in returns.iter().enumerate() {
            let first = i == 0 || returns[i - 1].record.symbol != r.record.symbol;
            if first {
                prop_assert!(r.daily_return.is_none());
                seen_close = false;
            } else {
                // generated closes are strictly positive
                prop_assert_eq!(r.daily_return.is_some(), seen_close);
            }
            if r.record.close.is_none() && seen_close {
                prop_assert_eq!(r.daily_return, Some(0.0));
            }
            seen_close |= r.record.close.is_some();
        }
    }

    #[test]
    fn gap_free_series_has_exactly_one_missing_return(closes in prop::collection::vec(1.0..500.0_f64, 1..40)) {
        let normalized = Normalizer::normalize(&[series_batch(&closes)]).unwrap();
        let returns = compute_returns(normalized.records);
        let missing = returns.iter().filter(|r| r.daily_return.is_none()).count();
        prop_assert_eq!(missing, 1);
        prop_assert!(returns[0].daily_return.is_none());
    }
}

// ── 3. Volatility ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn volatility_defined_iff_two_numeric_returns(closes in arb_closes()) {
        let normalized = Normalizer::normalize(&[series_batch(&closes)]).unwrap();
        let returns = compute_returns(normalized.records);
        let numeric = returns.iter().filter(|r| r.daily_return.is_some()).count();
        let summary = &aggregate(&returns)[0];
        match summary.volatility {
            None => prop_assert!(numeric < 2),
            Some(v) => {
                prop_assert!(numeric >= 2);
                prop_assert!(v >= 0.0);
            }
        }
    }
}

// ── 4. Moving averages ───────────────────────────────────────────────

proptest! {
    #[test]
    fn moving_averages_match_tail_mean(closes in arb_closes()) {
        let normalized = Normalizer::normalize(&[series_batch(&closes)]).unwrap();
        let parsed: Vec<f64> = normalized.records.iter().filter_map(|r| r.close).collect();
        let summary = &aggregate(&compute_returns(normalized.records))[0];

        for (window, value) in [(SHORT_WINDOW, summary.moving_avg_5), (LONG_WINDOW, summary.moving_avg_10)] {
            if parsed.len() < window {
                prop_assert!(value.is_none());
            } else {
                let tail = &parsed[parsed.len() - window..];
                let mean = tail.iter().sum::<f64>() / window as f64;
                prop_assert!((value.unwrap() - mean).abs() < 1e-9);
            }
        }
    }
}
