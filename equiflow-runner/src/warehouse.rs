//! Two-tier warehouse: an append-only staging table and a keyed enterprise table.
//!
//! A run appends its rows to staging tagged with its run id, then merges them
//! into the enterprise table with one set-based upsert. The merge is the only
//! statement that mutates enterprise data and runs inside an IMMEDIATE
//! transaction, so concurrent runs serialize on it.

use std::time::Duration;

use chrono::NaiveDate;
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use equiflow_core::domain::{NormalizedRecord, WarehouseRow};

use crate::config::WarehouseConfig;
use crate::run_id::RunId;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid table name '{0}'")]
    InvalidTable(String),
    #[error("failed to create warehouse directory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("volume for {symbol} on {date} does not fit the warehouse column")]
    ValueOutOfRange { symbol: String, date: NaiveDate },
    #[error("unreadable warehouse row: {0}")]
    Corrupt(String),
}

/// Row counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Staged rows of the run, duplicates included.
    pub staged: usize,
    /// Keys that were new to the enterprise table.
    pub inserted: usize,
    /// Keys that already existed and had their values overwritten.
    pub updated: usize,
}

/// The staging + merge contract the pipeline reconciles through.
pub trait UpsertStore {
    /// Append rows to staging under `run_id`. Returns rows written.
    fn stage(&mut self, run_id: &RunId, rows: &[WarehouseRow]) -> Result<usize, WarehouseError>;

    /// Upsert the run's staged rows into the enterprise table.
    ///
    /// All-or-nothing. Within the run, the last staged row per (symbol, date)
    /// wins. Merging the same run again leaves the enterprise table unchanged.
    fn merge(&mut self, run_id: &RunId) -> Result<MergeReport, WarehouseError>;
}

/// Keep records whose price and volume fields are all present.
///
/// Returns the rows and the number of records skipped as incomplete.
pub fn to_warehouse_rows(records: &[NormalizedRecord]) -> (Vec<WarehouseRow>, usize) {
    let rows: Vec<WarehouseRow> = records.iter().filter_map(WarehouseRow::from_record).collect();
    let skipped = records.len() - rows.len();
    (rows, skipped)
}

/// SQLite-backed warehouse.
pub struct SqliteWarehouse {
    conn: Connection,
    staging: String,
    enterprise: String,
}

impl SqliteWarehouse {
    /// Open (creating if needed) the database file named in `config`.
    pub fn open(config: &WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| WarehouseError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(&config.path)?;
        Self::with_connection(
            conn,
            &config.staging_table,
            &config.enterprise_table,
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory(staging: &str, enterprise: &str) -> Result<Self, WarehouseError> {
        Self::with_connection(
            Connection::open_in_memory()?,
            staging,
            enterprise,
            Duration::from_secs(5),
        )
    }

    fn with_connection(
        conn: Connection,
        staging: &str,
        enterprise: &str,
        busy_timeout: Duration,
    ) -> Result<Self, WarehouseError> {
        // Table names are interpolated into SQL below.
        for name in [staging, enterprise] {
            if !is_sql_identifier(name) {
                return Err(WarehouseError::InvalidTable(name.to_string()));
            }
        }
        conn.busy_timeout(busy_timeout)?;
        Ok(Self {
            conn,
            staging: staging.to_string(),
            enterprise: enterprise.to_string(),
        })
    }

    /// Create both tables and their indexes if they do not exist.
    pub fn bootstrap(&self) -> Result<(), WarehouseError> {
        let (stg, edw) = (&self.staging, &self.enterprise);
        self.conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {stg} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                date TEXT NOT NULL,
                open REAL NOT NULL CHECK (open >= 0),
                high REAL NOT NULL CHECK (high >= 0),
                low REAL NOT NULL CHECK (low >= 0),
                close REAL NOT NULL CHECK (close >= 0),
                volume INTEGER NOT NULL CHECK (volume >= 0),
                symbol TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{stg}_run ON {stg}(run_id, symbol, date);

            CREATE TABLE IF NOT EXISTS {edw} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date TEXT NOT NULL,
                open REAL NOT NULL CHECK (open >= 0),
                high REAL NOT NULL CHECK (high >= 0),
                low REAL NOT NULL CHECK (low >= 0),
                close REAL NOT NULL CHECK (close >= 0),
                volume INTEGER NOT NULL CHECK (volume >= 0),
                symbol TEXT NOT NULL,
                UNIQUE (symbol, date)
            );"
        ))?;
        tracing::debug!(staging = %stg, enterprise = %edw, "warehouse schema ready");
        Ok(())
    }

    /// Every enterprise row, ordered by (symbol, date).
    pub fn enterprise_rows(&self) -> Result<Vec<WarehouseRow>, WarehouseError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT symbol, date, open, high, low, close, volume
             FROM {} ORDER BY symbol, date",
            self.enterprise
        ))?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(symbol, date, open, high, low, close, volume)| {
                let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .map_err(|e| WarehouseError::Corrupt(format!("date '{date}': {e}")))?;
                let volume = u64::try_from(volume)
                    .map_err(|_| WarehouseError::Corrupt(format!("negative volume {volume}")))?;
                Ok(WarehouseRow {
                    symbol,
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume,
                })
            })
            .collect()
    }

    pub fn enterprise_count(&self) -> Result<usize, WarehouseError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.enterprise),
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    pub fn staged_count(&self, run_id: &RunId) -> Result<usize, WarehouseError> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE run_id = ?1", self.staging),
            [run_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Surrogate id of an enterprise row.
    pub fn enterprise_id(&self, symbol: &str, date: NaiveDate) -> Result<Option<i64>, WarehouseError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} WHERE symbol = ?1 AND date = ?2",
            self.enterprise
        ))?;
        let mut rows = stmt.query(params![symbol, date.format("%Y-%m-%d").to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

impl UpsertStore for SqliteWarehouse {
    fn stage(&mut self, run_id: &RunId, rows: &[WarehouseRow]) -> Result<usize, WarehouseError> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (run_id, date, open, high, low, close, volume, symbol)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                self.staging
            ))?;
            for row in rows {
                let volume = i64::try_from(row.volume).map_err(|_| WarehouseError::ValueOutOfRange {
                    symbol: row.symbol.clone(),
                    date: row.date,
                })?;
                stmt.execute(params![
                    run_id.as_str(),
                    row.date.format("%Y-%m-%d").to_string(),
                    row.open,
                    row.high,
                    row.low,
                    row.close,
                    volume,
                    row.symbol,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(run_id = %run_id, rows = rows.len(), "staged rows");
        Ok(rows.len())
    }

    fn merge(&mut self, run_id: &RunId) -> Result<MergeReport, WarehouseError> {
        let (stg, edw) = (self.staging.clone(), self.enterprise.clone());
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let count = |sql: String| -> Result<usize, rusqlite::Error> {
            let n: i64 = tx.query_row(&sql, [run_id.as_str()], |row| row.get(0))?;
            Ok(n as usize)
        };
        let staged = count(format!("SELECT COUNT(*) FROM {stg} WHERE run_id = ?1"))?;
        let keys = count(format!(
            "SELECT COUNT(*) FROM (SELECT DISTINCT symbol, date FROM {stg} WHERE run_id = ?1)"
        ))?;
        let updated = count(format!(
            "SELECT COUNT(*) FROM (
                SELECT DISTINCT s.symbol, s.date FROM {stg} s
                JOIN {edw} e ON e.symbol = s.symbol AND e.date = s.date
                WHERE s.run_id = ?1
            )"
        ))?;

        tx.execute(
            &format!(
                "INSERT INTO {edw} (date, open, high, low, close, volume, symbol)
                 SELECT s.date, s.open, s.high, s.low, s.close, s.volume, s.symbol
                 FROM {stg} s
                 WHERE s.run_id = ?1
                   AND s.id = (
                       SELECT MAX(s2.id) FROM {stg} s2
                       WHERE s2.run_id = s.run_id AND s2.symbol = s.symbol AND s2.date = s.date
                   )
                 ON CONFLICT (symbol, date) DO UPDATE SET
                     open = excluded.open,
                     high = excluded.high,
                     low = excluded.low,
                     close = excluded.close,
                     volume = excluded.volume"
            ),
            [run_id.as_str()],
        )?;
        tx.commit()?;

        let report = MergeReport {
            staged,
            inserted: keys - updated,
            updated,
        };
        tracing::info!(
            run_id = %run_id,
            staged = report.staged,
            inserted = report.inserted,
            updated = report.updated,
            "merged staging into enterprise table"
        );
        Ok(report)
    }
}

/// ASCII letter or underscore, then letters, digits or underscores.
pub(crate) fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Bootstrap the warehouse described by `config`.
pub fn init_warehouse(config: &WarehouseConfig) -> Result<SqliteWarehouse, WarehouseError> {
    let warehouse = SqliteWarehouse::open(config)?;
    warehouse.bootstrap()?;
    tracing::info!(path = %config.path.display(), "warehouse initialized");
    Ok(warehouse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn warehouse() -> SqliteWarehouse {
        let w = SqliteWarehouse::open_in_memory("stg_stock_data", "edw_stock_data").unwrap();
        w.bootstrap().unwrap();
        w
    }

    fn run(n: u32) -> RunId {
        RunId::generate(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, n).unwrap(), b"t")
    }

    fn row(symbol: &str, day: u32, close: f64) -> WarehouseRow {
        WarehouseRow {
            symbol: symbol.into(),
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn bootstrap_is_idempotent() {
        let w = warehouse();
        w.bootstrap().unwrap();
        assert_eq!(w.enterprise_count().unwrap(), 0);
    }

    #[test]
    fn upsert_updates_close_and_keeps_row_identity() {
        let mut w = warehouse();
        let first = run(1);
        w.stage(&first, &[row("AAPL", 2, 108.0)]).unwrap();
        let report = w.merge(&first).unwrap();
        assert_eq!(report, MergeReport { staged: 1, inserted: 1, updated: 0 });
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let id = w.enterprise_id("AAPL", date).unwrap();

        let second = run(2);
        w.stage(&second, &[row("AAPL", 2, 110.0)]).unwrap();
        let report = w.merge(&second).unwrap();
        assert_eq!(report, MergeReport { staged: 1, inserted: 0, updated: 1 });

        let rows = w.enterprise_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 110.0);
        assert_eq!(w.enterprise_id("AAPL", date).unwrap(), id);
    }

    #[test]
    fn merging_a_run_twice_changes_nothing() {
        let mut w = warehouse();
        let id = run(1);
        w.stage(&id, &[row("AAPL", 2, 1.0), row("MSFT", 2, 2.0)]).unwrap();
        w.merge(&id).unwrap();
        let before = w.enterprise_rows().unwrap();
        let again = w.merge(&id).unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.updated, 2);
        assert_eq!(w.enterprise_rows().unwrap(), before);
    }

    #[test]
    fn last_staged_row_per_key_wins_within_a_run() {
        let mut w = warehouse();
        let id = run(1);
        w.stage(&id, &[row("AAPL", 2, 1.0), row("AAPL", 2, 3.0)]).unwrap();
        let report = w.merge(&id).unwrap();
        assert_eq!(report.staged, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(w.enterprise_rows().unwrap()[0].close, 3.0);
    }

    #[test]
    fn merge_only_touches_its_own_run() {
        let mut w = warehouse();
        let (a, b) = (run(1), run(2));
        w.stage(&a, &[row("AAPL", 2, 1.0)]).unwrap();
        w.stage(&b, &[row("MSFT", 2, 2.0)]).unwrap();
        w.merge(&a).unwrap();
        let rows = w.enterprise_rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "AAPL");
        assert_eq!(w.staged_count(&b).unwrap(), 1);
    }

    #[test]
    fn negative_values_are_rejected_by_the_schema() {
        let mut w = warehouse();
        let mut bad = row("AAPL", 2, 1.0);
        bad.close = -1.0;
        assert!(w.stage(&run(1), &[bad]).is_err());
        assert_eq!(w.staged_count(&run(1)).unwrap(), 0);
    }

    #[test]
    fn table_names_must_be_identifiers() {
        let err = SqliteWarehouse::open_in_memory("stg; DROP TABLE x", "edw").err().unwrap();
        assert!(matches!(err, WarehouseError::InvalidTable(_)));
    }

    #[test]
    fn sql_identifier_rules() {
        for ok in ["stg_stock_data", "_t", "EDW2"] {
            assert!(is_sql_identifier(ok), "{ok}");
        }
        for bad in ["", "2edw", "stg-data", "stg data", "edw;", "t\u{e9}"] {
            assert!(!is_sql_identifier(bad), "{bad}");
        }
    }

    #[test]
    fn incomplete_records_are_skipped() {
        let complete = NormalizedRecord {
            symbol: "AAPL".into(),
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: Some(1.0),
            high: Some(1.0),
            low: Some(1.0),
            close: Some(1.0),
            volume: Some(1),
        };
        let mut incomplete = complete.clone();
        incomplete.volume = None;
        let (rows, skipped) = to_warehouse_rows(&[complete, incomplete]);
        assert_eq!(rows.len(), 1);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn opens_a_file_database_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = WarehouseConfig {
            path: dir.path().join("nested").join("warehouse.db"),
            ..WarehouseConfig::default()
        };
        let w = init_warehouse(&config).unwrap();
        assert_eq!(w.enterprise_count().unwrap(), 0);
        assert!(config.path.exists());
    }
}
