//! Equiflow Core: price records, normalization, returns and per-symbol aggregation.
//!
//! This crate holds the pure transform path of the daily price pipeline:
//! - Domain types (raw batches, normalized records, return records, summaries)
//! - Header resolution and normalization with an explicit drop/parse report
//! - Record-to-record return series
//! - Per-symbol summary statistics
//! - The market data provider seam and its Alpha Vantage implementation
//!
//! Nothing here touches the filesystem layout of a run or the warehouse;
//! that lives in `equiflow-runner`.

pub mod analytics;
pub mod data;
pub mod domain;
