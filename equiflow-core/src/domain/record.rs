//! Price records: raw source rows, normalized rows, and rows carrying a return.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A batch of raw source rows with its own header line.
///
/// Column order and casing are whatever the source produced; the normalizer
/// resolves them. Cells are kept as strings so that coercion failures can be
/// detected per field instead of failing the whole batch at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    /// Where the batch came from: the symbol for API batches, the file name for CSV input.
    pub label: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawBatch {
    pub fn new(label: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            label: label.into(),
            headers,
            rows: Vec::new(),
        }
    }

    /// Build a batch from string-slice literals. Mostly useful in tests and fixtures.
    pub fn from_rows(label: &str, headers: &[&str], rows: &[&[&str]]) -> Self {
        Self {
            label: label.to_string(),
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    pub fn push_row(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A canonical daily price row.
///
/// Invariants established by the normalizer:
/// - `symbol` is trimmed and uppercase
/// - prices are finite and non-negative when present
/// - a value that failed to parse is `None`, never zero
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
}

impl NormalizedRecord {
    /// ISO 8601 calendar date (`YYYY-MM-DD`).
    pub fn iso_date(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }

    /// True when every price and volume field parsed.
    pub fn is_complete(&self) -> bool {
        self.open.is_some()
            && self.high.is_some()
            && self.low.is_some()
            && self.close.is_some()
            && self.volume.is_some()
    }
}

/// A normalized row plus its record-to-record close return.
///
/// `daily_return` is `None` for the first row of each symbol and wherever
/// either close involved is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub record: NormalizedRecord,
    pub daily_return: Option<f64>,
}

/// A row as persisted in the staging and enterprise tables.
///
/// Only complete records become warehouse rows: the tables declare every
/// value column `NOT NULL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl WarehouseRow {
    /// Convert a normalized record, or `None` if any value field is missing.
    pub fn from_record(record: &NormalizedRecord) -> Option<Self> {
        Some(Self {
            symbol: record.symbol.clone(),
            date: record.date,
            open: record.open?,
            high: record.high?,
            low: record.low?,
            close: record.close?,
            volume: record.volume?,
        })
    }
}
