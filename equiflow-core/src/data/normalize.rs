//! Normalizer: turns raw batches into canonical, deduplicated, sorted records.
//!
//! Row-level problems never abort the batch:
//! - a numeric cell that does not parse becomes `None` and is counted
//! - a row with an unparsable date or an empty symbol is dropped and counted
//!
//! Only a missing required column is fatal (`SchemaError`).

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::schema::{ColumnMap, Field, SchemaError};
use crate::domain::{NormalizedRecord, RawBatch};

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%Y%m%d"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

/// Clean records plus an account of everything that was dropped or coerced.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    /// Sorted by (symbol, date ascending), one record per key.
    pub records: Vec<NormalizedRecord>,
    pub report: NormalizeReport,
}

/// Row and field counts from one normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub input_rows: usize,
    pub output_rows: usize,
    pub dropped_bad_date: usize,
    pub dropped_missing_symbol: usize,
    /// Rows replaced by a later row with the same (symbol, date).
    pub duplicates_collapsed: usize,
    /// Cells that became missing, keyed by canonical field name.
    pub field_parse_failures: BTreeMap<String, usize>,
}

impl NormalizeReport {
    /// Rows removed for being invalid (duplicates are not counted here).
    pub fn dropped_rows(&self) -> usize {
        self.dropped_bad_date + self.dropped_missing_symbol
    }

    /// Fraction of input rows that were dropped as invalid.
    pub fn dropped_fraction(&self) -> f64 {
        if self.input_rows == 0 {
            return 0.0;
        }
        self.dropped_rows() as f64 / self.input_rows as f64
    }

    fn record_parse_failure(&mut self, field: Field) {
        *self
            .field_parse_failures
            .entry(field.name().to_string())
            .or_insert(0) += 1;
    }
}

/// Normalizer for raw price batches.
pub struct Normalizer;

impl Normalizer {
    /// Resolve the column layout of every batch, failing on the first batch
    /// that lacks a required column. Reads no rows.
    pub fn resolve_schemas(batches: &[RawBatch]) -> Result<Vec<ColumnMap>, SchemaError> {
        batches
            .iter()
            .map(|b| ColumnMap::resolve(&b.label, &b.headers))
            .collect()
    }

    /// Normalize a set of batches into one canonical record set.
    ///
    /// Every batch's headers are checked before any row is read, so a schema
    /// failure leaves no partial output behind. Duplicate (symbol, date) keys
    /// collapse to the last-seen row across all batches.
    pub fn normalize(batches: &[RawBatch]) -> Result<Normalized, SchemaError> {
        let maps = Self::resolve_schemas(batches)?;

        let mut report = NormalizeReport::default();
        let mut by_key: BTreeMap<(String, NaiveDate), NormalizedRecord> = BTreeMap::new();

        for (batch, map) in batches.iter().zip(&maps) {
            for row in &batch.rows {
                report.input_rows += 1;

                let symbol = normalize_symbol(map.cell(row, Field::Symbol));
                if symbol.is_empty() {
                    report.dropped_missing_symbol += 1;
                    continue;
                }

                let Some(date) = parse_date(map.cell(row, Field::Date)) else {
                    debug!(
                        batch = %batch.label,
                        raw = map.cell(row, Field::Date),
                        "dropping row with unparsable date"
                    );
                    report.dropped_bad_date += 1;
                    continue;
                };

                let mut price = |field: Field| {
                    let value = parse_price(map.cell(row, field));
                    if value.is_none() {
                        report.record_parse_failure(field);
                    }
                    value
                };
                let open = price(Field::Open);
                let high = price(Field::High);
                let low = price(Field::Low);
                let close = price(Field::Close);

                let volume = parse_volume(map.cell(row, Field::Volume));
                if volume.is_none() {
                    report.record_parse_failure(Field::Volume);
                }

                let record = NormalizedRecord {
                    symbol: symbol.clone(),
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume,
                };
                if by_key.insert((symbol, date), record).is_some() {
                    report.duplicates_collapsed += 1;
                }
            }
        }

        let records: Vec<NormalizedRecord> = by_key.into_values().collect();
        report.output_rows = records.len();

        if report.dropped_rows() > 0 {
            warn!(
                dropped_bad_date = report.dropped_bad_date,
                dropped_missing_symbol = report.dropped_missing_symbol,
                input_rows = report.input_rows,
                "normalizer dropped invalid rows"
            );
        }

        Ok(Normalized { records, report })
    }
}

/// Trim and uppercase a ticker symbol.
pub fn normalize_symbol(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Parse a calendar date from any of the accepted source formats.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.date_naive()))
}

/// Parse a non-negative, finite price. Thousands separators are accepted.
pub fn parse_price(raw: &str) -> Option<f64> {
    let value: f64 = strip_separators(raw).parse().ok()?;
    (value.is_finite() && value >= 0.0).then_some(value)
}

/// Parse a non-negative integral volume (`1200` or `1200.0`, not `12.5`).
pub fn parse_volume(raw: &str) -> Option<u64> {
    let cleaned = strip_separators(raw);
    if let Ok(v) = cleaned.parse::<u64>() {
        return Some(v);
    }
    let value: f64 = cleaned.parse().ok()?;
    if value.is_finite() && value >= 0.0 && value.fract() == 0.0 && value < u64::MAX as f64 {
        Some(value as u64)
    } else {
        None
    }
}

fn strip_separators(raw: &str) -> String {
    raw.trim().chars().filter(|c| *c != ',').collect()
}
