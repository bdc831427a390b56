//! Artifact store: per-run directory of intermediate files plus a manifest.
//!
//! Layout:
//! ```text
//! <working_dir>/<run_id>/
//!     manifest.json
//!     <raw_prefix>_<YYYYMMDD_HHMMSS>.csv
//!     <normalized_prefix>_<YYYYMMDD_HHMMSS>.csv
//!     <aggregated_prefix>_<YYYYMMDD_HHMMSS>.csv
//!     <aggregated_prefix>_<YYYYMMDD_HHMMSS>.parquet
//! ```
//!
//! Downstream steps find a run's files through its manifest, never by
//! scanning for the newest file.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::{Column, DataFrame, DataType, ParquetWriter, PolarsError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use equiflow_core::data::NormalizeReport;
use equiflow_core::domain::{RawBatch, ReturnRecord, SymbolSummary};

use crate::config::PathsConfig;
use crate::run_id::RunId;
use crate::state::PipelineState;
use crate::warehouse::MergeReport;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Current schema version of `manifest.json`.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV write failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("parquet write failed: {0}")]
    Parquet(String),
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no manifest for run {0}")]
    ManifestNotFound(RunId),
    #[error("run {run_id} has no {kind} artifact")]
    MissingArtifact { run_id: RunId, kind: ArtifactKind },
    #[error("raw batches disagree on headers: '{first}' vs '{other}'")]
    HeaderMismatch { first: String, other: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// What an artifact holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Extracted source rows, untyped.
    Raw,
    /// Normalized records with their daily return.
    Normalized,
    /// One summary row per symbol.
    Summary,
    /// Same rows as `Summary`, columnar.
    SummaryParquet,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ArtifactKind::Raw => "raw",
            ArtifactKind::Normalized => "normalized",
            ArtifactKind::Summary => "summary",
            ArtifactKind::SummaryParquet => "summary parquet",
        };
        f.write_str(name)
    }
}

/// One file of a run, relative to the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub kind: ArtifactKind,
    pub file: String,
    pub rows: usize,
}

/// JSON record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: PipelineState,
    pub artifacts: Vec<ArtifactEntry>,
    #[serde(default)]
    pub normalize_report: Option<NormalizeReport>,
    #[serde(default)]
    pub merge_report: Option<MergeReport>,
}

fn default_schema_version() -> u32 {
    MANIFEST_SCHEMA_VERSION
}

impl RunManifest {
    pub fn new(run_id: RunId, created_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id,
            created_at,
            updated_at: created_at,
            state: PipelineState::Idle,
            artifacts: Vec::new(),
            normalize_report: None,
            merge_report: None,
        }
    }

    /// Most recent artifact of `kind`.
    pub fn artifact_for(&self, kind: ArtifactKind) -> Option<&ArtifactEntry> {
        self.artifacts.iter().rev().find(|a| a.kind == kind)
    }

    fn record(&mut self, kind: ArtifactKind, file: String, rows: usize) {
        self.artifacts.push(ArtifactEntry { kind, file, rows });
        self.updated_at = Utc::now();
    }
}

/// File name prefixes per artifact family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPrefixes {
    pub raw: String,
    pub normalized: String,
    pub aggregated: String,
}

impl From<&PathsConfig> for ArtifactPrefixes {
    fn from(paths: &PathsConfig) -> Self {
        Self {
            raw: paths.raw_prefix.clone(),
            normalized: paths.normalized_prefix.clone(),
            aggregated: paths.aggregated_prefix.clone(),
        }
    }
}

/// Writes and reads the files of pipeline runs under one working directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    working_dir: PathBuf,
    prefixes: ArtifactPrefixes,
}

impl ArtifactStore {
    /// No directory is created until the first artifact is written.
    pub fn new(working_dir: impl Into<PathBuf>, prefixes: ArtifactPrefixes) -> Self {
        Self {
            working_dir: working_dir.into(),
            prefixes,
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(paths.working_dir.clone(), ArtifactPrefixes::from(paths))
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.working_dir.join(run_id.as_str())
    }

    /// Absolute path of an entry of `manifest`.
    pub fn artifact_path(&self, manifest: &RunManifest, entry: &ArtifactEntry) -> PathBuf {
        self.run_dir(&manifest.run_id).join(&entry.file)
    }

    fn file_name(prefix: &str, manifest: &RunManifest, ext: &str) -> String {
        format!("{prefix}_{}.{ext}", manifest.created_at.format("%Y%m%d_%H%M%S"))
    }

    fn ensure_run_dir(&self, run_id: &RunId) -> Result<PathBuf, ArtifactError> {
        let dir = self.run_dir(run_id);
        std::fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(dir)
    }

    /// Write the extracted batches as one CSV. All batches must share a header line.
    pub fn write_raw(
        &self,
        manifest: &mut RunManifest,
        batches: &[RawBatch],
    ) -> Result<PathBuf, ArtifactError> {
        let headers: &[String] = batches.first().map(|b| b.headers.as_slice()).unwrap_or(&[]);
        if let Some(other) = batches.iter().find(|b| b.headers != headers) {
            return Err(ArtifactError::HeaderMismatch {
                first: headers.join(","),
                other: other.headers.join(","),
            });
        }

        let file = Self::file_name(&self.prefixes.raw, manifest, "csv");
        let path = self.ensure_run_dir(&manifest.run_id)?.join(&file);
        let mut rows = 0;
        write_atomically(&path, |w| {
            let mut wtr = csv::Writer::from_writer(w);
            wtr.write_record(headers)?;
            for batch in batches {
                for row in &batch.rows {
                    wtr.write_record(row)?;
                    rows += 1;
                }
            }
            wtr.flush().map_err(csv::Error::from)?;
            Ok(())
        })?;

        manifest.record(ArtifactKind::Raw, file, rows);
        Ok(path)
    }

    /// Write normalized records with their daily return. Missing values are empty cells.
    pub fn write_normalized(
        &self,
        manifest: &mut RunManifest,
        records: &[ReturnRecord],
    ) -> Result<PathBuf, ArtifactError> {
        let file = Self::file_name(&self.prefixes.normalized, manifest, "csv");
        let path = self.ensure_run_dir(&manifest.run_id)?.join(&file);
        write_atomically(&path, |w| {
            let mut wtr = csv::Writer::from_writer(w);
            wtr.write_record([
                "symbol",
                "date",
                "open",
                "high",
                "low",
                "close",
                "volume",
                "daily_return",
            ])?;
            for r in records {
                let rec = &r.record;
                wtr.write_record([
                    rec.symbol.clone(),
                    rec.iso_date(),
                    opt_cell(rec.open),
                    opt_cell(rec.high),
                    opt_cell(rec.low),
                    opt_cell(rec.close),
                    rec.volume.map(|v| v.to_string()).unwrap_or_default(),
                    opt_cell(r.daily_return),
                ])?;
            }
            wtr.flush().map_err(csv::Error::from)?;
            Ok(())
        })?;

        manifest.record(ArtifactKind::Normalized, file, records.len());
        Ok(path)
    }

    /// Write the per-symbol summaries as CSV and Parquet. Returns the CSV path.
    pub fn write_summaries(
        &self,
        manifest: &mut RunManifest,
        summaries: &[SymbolSummary],
    ) -> Result<PathBuf, ArtifactError> {
        let dir = self.ensure_run_dir(&manifest.run_id)?;
        let csv_file = Self::file_name(&self.prefixes.aggregated, manifest, "csv");
        let parquet_file = Self::file_name(&self.prefixes.aggregated, manifest, "parquet");
        let csv_path = dir.join(&csv_file);

        write_atomically(&csv_path, |w| {
            let mut wtr = csv::Writer::from_writer(w);
            wtr.write_record(SUMMARY_COLUMNS)?;
            for s in summaries {
                wtr.write_record([
                    s.symbol.clone(),
                    opt_cell(s.average_price),
                    s.total_volume.to_string(),
                    opt_cell(s.mean_daily_return),
                    opt_cell(s.volatility),
                    opt_cell(s.moving_avg_5),
                    opt_cell(s.moving_avg_10),
                    s.max_date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default(),
                    s.observations.to_string(),
                ])?;
            }
            wtr.flush().map_err(csv::Error::from)?;
            Ok(())
        })?;
        write_summaries_parquet(&dir.join(&parquet_file), summaries)?;

        manifest.record(ArtifactKind::Summary, csv_file, summaries.len());
        manifest.record(ArtifactKind::SummaryParquet, parquet_file, summaries.len());
        Ok(csv_path)
    }

    /// Persist the manifest, creating the run directory if needed.
    pub fn save_manifest(&self, manifest: &RunManifest) -> Result<PathBuf, ArtifactError> {
        let path = self.ensure_run_dir(&manifest.run_id)?.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest)?;
        write_atomically(&path, |w| {
            w.write_all(json.as_bytes()).map_err(io_error(&path))?;
            Ok(())
        })?;
        Ok(path)
    }

    pub fn load_manifest(&self, run_id: &RunId) -> Result<RunManifest, ArtifactError> {
        let path = self.run_dir(run_id).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(ArtifactError::ManifestNotFound(run_id.clone()));
        }
        let json = std::fs::read_to_string(&path).map_err(io_error(&path))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Path of the raw artifact recorded for `run_id`.
    pub fn raw_artifact(&self, run_id: &RunId) -> Result<PathBuf, ArtifactError> {
        let manifest = self.load_manifest(run_id)?;
        let entry = manifest
            .artifact_for(ArtifactKind::Raw)
            .ok_or_else(|| ArtifactError::MissingArtifact {
                run_id: run_id.clone(),
                kind: ArtifactKind::Raw,
            })?;
        Ok(self.artifact_path(&manifest, entry))
    }
}

const SUMMARY_COLUMNS: [&str; 9] = [
    "symbol",
    "average_price",
    "total_volume",
    "mean_daily_return",
    "volatility",
    "moving_avg_5",
    "moving_avg_10",
    "max_date",
    "observations",
];

fn opt_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// Write through a sibling temp file so a failed write leaves nothing at `path`.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), ArtifactError>
where
    F: FnOnce(&mut File) -> Result<(), ArtifactError>,
{
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
    if let Err(e) = write(&mut file).and_then(|()| file.sync_all().map_err(io_error(&tmp))) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path).map_err(io_error(path))
}

fn write_summaries_parquet(path: &Path, summaries: &[SymbolSummary]) -> Result<(), ArtifactError> {
    let parquet_error = |e: PolarsError| ArtifactError::Parquet(e.to_string());
    let floats = |f: fn(&SymbolSummary) -> Option<f64>| summaries.iter().map(f).collect::<Vec<_>>();

    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default();
    let max_dates: Vec<Option<i32>> = summaries
        .iter()
        .map(|s| s.max_date.map(|d| (d - epoch).num_days() as i32))
        .collect();

    let mut df = DataFrame::new(vec![
        Column::new(
            "symbol".into(),
            summaries.iter().map(|s| s.symbol.clone()).collect::<Vec<_>>(),
        ),
        Column::new("average_price".into(), floats(|s| s.average_price)),
        Column::new(
            "total_volume".into(),
            summaries.iter().map(|s| s.total_volume).collect::<Vec<u64>>(),
        ),
        Column::new("mean_daily_return".into(), floats(|s| s.mean_daily_return)),
        Column::new("volatility".into(), floats(|s| s.volatility)),
        Column::new("moving_avg_5".into(), floats(|s| s.moving_avg_5)),
        Column::new("moving_avg_10".into(), floats(|s| s.moving_avg_10)),
        Column::new("max_date".into(), max_dates)
            .cast(&DataType::Date)
            .map_err(parquet_error)?,
        Column::new(
            "observations".into(),
            summaries.iter().map(|s| s.observations as u64).collect::<Vec<u64>>(),
        ),
    ])
    .map_err(parquet_error)?;

    write_atomically(path, |file| {
        ParquetWriter::new(file)
            .finish(&mut df)
            .map_err(parquet_error)?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use equiflow_core::domain::NormalizedRecord;

    fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::from_config(&PathsConfig {
            working_dir: dir.to_path_buf(),
            ..PathsConfig::default()
        })
    }

    fn manifest() -> RunManifest {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        RunManifest::new(RunId::generate(at, b"test"), at)
    }

    fn return_record(symbol: &str, close: Option<f64>, ret: Option<f64>) -> ReturnRecord {
        ReturnRecord {
            record: NormalizedRecord {
                symbol: symbol.into(),
                date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                open: Some(1.0),
                high: Some(1.0),
                low: Some(1.0),
                close,
                volume: None,
            },
            daily_return: ret,
        }
    }

    #[test]
    fn nothing_touches_disk_until_an_artifact_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dataset");
        let s = store(&root);
        let m = manifest();
        assert_eq!(s.run_dir(&m.run_id), root.join(m.run_id.as_str()));
        assert!(!root.exists());
    }

    #[test]
    fn normalized_file_is_named_by_prefix_and_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut m = manifest();
        let path = s
            .write_normalized(&mut m, &[return_record("AAPL", None, Some(0.1))])
            .unwrap();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "transformed_data_20240102_030405.csv"
        );
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("symbol,date,open,high,low,close,volume,daily_return")
        );
        assert_eq!(lines.next(), Some("AAPL,2024-01-02,1,1,1,,,0.1"));
        assert_eq!(m.artifact_for(ArtifactKind::Normalized).unwrap().rows, 1);
    }

    #[test]
    fn summaries_are_written_as_csv_and_parquet() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut m = manifest();
        let summary = SymbolSummary {
            symbol: "AAPL".into(),
            average_price: Some(105.0),
            total_volume: 30,
            mean_daily_return: Some(0.05),
            volatility: None,
            moving_avg_5: None,
            moving_avg_10: None,
            max_date: NaiveDate::from_ymd_opt(2024, 1, 3),
            observations: 2,
        };
        s.write_summaries(&mut m, &[summary]).unwrap();

        let csv = m.artifact_for(ArtifactKind::Summary).unwrap();
        let parquet = m.artifact_for(ArtifactKind::SummaryParquet).unwrap();
        assert!(s.artifact_path(&m, csv).exists());
        assert!(s.artifact_path(&m, parquet).exists());
        assert!(parquet.file.ends_with(".parquet"));

        let text = std::fs::read_to_string(s.artifact_path(&m, csv)).unwrap();
        assert!(text.contains("AAPL,105,30,0.05,,,,2024-01-03,2"));
    }

    #[test]
    fn manifest_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut m = manifest();
        let batch = RawBatch::from_rows("AAPL", &["date", "symbol"], &[&["2024-01-02", "AAPL"]]);
        s.write_raw(&mut m, &[batch]).unwrap();
        s.save_manifest(&m).unwrap();

        let loaded = s.load_manifest(&m.run_id).unwrap();
        assert_eq!(loaded, m);
        let raw = s.raw_artifact(&m.run_id).unwrap();
        assert_eq!(std::fs::read_to_string(raw).unwrap(), "date,symbol\n2024-01-02,AAPL\n");
    }

    #[test]
    fn raw_batches_must_share_headers() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let mut m = manifest();
        let a = RawBatch::from_rows("a", &["date", "symbol"], &[]);
        let b = RawBatch::from_rows("b", &["symbol", "date"], &[]);
        let err = s.write_raw(&mut m, &[a, b]).unwrap_err();
        assert!(matches!(err, ArtifactError::HeaderMismatch { .. }));
        assert!(m.artifacts.is_empty());
    }

    #[test]
    fn unknown_run_has_no_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let err = store(dir.path()).load_manifest(&manifest().run_id).unwrap_err();
        assert!(matches!(err, ArtifactError::ManifestNotFound(_)));
    }
}
