//! Pipeline configuration.
//!
//! Loaded once from a TOML file (every section optional), then patched from
//! `EQUIFLOW_*` environment variables by the caller and validated. Components
//! receive the sections they need; nothing reads the environment later.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use equiflow_core::data::{AlphaVantageSettings, OutputSize, SymbolSpec};

use crate::warehouse::is_sql_identifier;

pub const ENV_WORKING_DIR: &str = "EQUIFLOW_WORKING_DIR";
pub const ENV_WAREHOUSE_PATH: &str = "EQUIFLOW_WAREHOUSE_PATH";
pub const ENV_API_KEY: &str = "EQUIFLOW_API_KEY";

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete configuration for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub warehouse: WarehouseConfig,
    pub provider: ProviderConfig,
    pub quality: QualityConfig,
    pub symbols: Vec<SymbolSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            warehouse: WarehouseConfig::default(),
            provider: ProviderConfig::default(),
            quality: QualityConfig::default(),
            symbols: default_universe(),
        }
    }
}

/// Where intermediate artifacts go and how they are named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub working_dir: PathBuf,
    pub raw_prefix: String,
    pub normalized_prefix: String,
    pub aggregated_prefix: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("dataset"),
            raw_prefix: "extracted_stock_data".into(),
            normalized_prefix: "transformed_data".into(),
            aggregated_prefix: "aggregated_data".into(),
        }
    }
}

/// Warehouse connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// SQLite database file.
    pub path: PathBuf,
    pub staging_table: String,
    pub enterprise_table: String,
    /// How long a run waits for another run's merge to finish.
    pub busy_timeout_ms: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("warehouse.db"),
            staging_table: "stg_stock_data".into(),
            enterprise_table: "edw_stock_data".into(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Market data API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub output_size: OutputSize,
    /// Pause between consecutive symbol requests.
    pub request_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: equiflow_core::data::alpha_vantage::DEFAULT_BASE_URL.into(),
            api_key: String::new(),
            output_size: OutputSize::Compact,
            request_delay_secs: 12,
            timeout_secs: 30,
        }
    }
}

impl ProviderConfig {
    pub fn request_delay(&self) -> Duration {
        Duration::from_secs(self.request_delay_secs)
    }

    pub fn settings(&self) -> AlphaVantageSettings {
        AlphaVantageSettings {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            output_size: self.output_size,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Data-quality gate applied after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Largest tolerated share of input rows dropped as invalid, in [0, 1].
    /// The default of 1.0 never fails a run.
    pub max_dropped_fraction: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_dropped_fraction: 1.0,
        }
    }
}

/// AAPL, MSFT, GOOG, AMZN, NFLX.
pub fn default_universe() -> Vec<SymbolSpec> {
    [
        ("AAPL", "Apple Inc."),
        ("MSFT", "Microsoft Corporation"),
        ("GOOG", "Alphabet Inc."),
        ("AMZN", "Amazon.com Inc."),
        ("NFLX", "Netflix Inc."),
    ]
    .into_iter()
    .map(|(s, n)| SymbolSpec::new(s, n))
    .collect()
}

impl PipelineConfig {
    /// Load a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `EQUIFLOW_*` overrides through `lookup` (usually `std::env::var`).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(ENV_WORKING_DIR) {
            self.paths.working_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup(ENV_WAREHOUSE_PATH) {
            self.warehouse.path = PathBuf::from(path);
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            self.provider.api_key = key;
        }
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefixes = [
            ("raw_prefix", &self.paths.raw_prefix),
            ("normalized_prefix", &self.paths.normalized_prefix),
            ("aggregated_prefix", &self.paths.aggregated_prefix),
        ];
        for (name, value) in prefixes {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("paths.{name} must not be empty")));
            }
        }

        for (name, table) in [
            ("staging_table", &self.warehouse.staging_table),
            ("enterprise_table", &self.warehouse.enterprise_table),
        ] {
            if !is_sql_identifier(table) {
                return Err(ConfigError::Invalid(format!(
                    "warehouse.{name} '{table}' is not a valid table name"
                )));
            }
        }
        if self
            .warehouse
            .staging_table
            .eq_ignore_ascii_case(&self.warehouse.enterprise_table)
        {
            return Err(ConfigError::Invalid(
                "warehouse staging and enterprise tables must differ".into(),
            ));
        }

        let fraction = self.quality.max_dropped_fraction;
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigError::Invalid(format!(
                "quality.max_dropped_fraction must be within [0, 1], got {fraction}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_toml_gives_documented_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.paths.working_dir, PathBuf::from("dataset"));
        assert_eq!(config.paths.raw_prefix, "extracted_stock_data");
        assert_eq!(config.paths.normalized_prefix, "transformed_data");
        assert_eq!(config.paths.aggregated_prefix, "aggregated_data");
        assert_eq!(config.warehouse.staging_table, "stg_stock_data");
        assert_eq!(config.warehouse.enterprise_table, "edw_stock_data");
        assert_eq!(config.provider.request_delay_secs, 12);
        assert_eq!(config.quality.max_dropped_fraction, 1.0);
        let symbols: Vec<&str> = config.symbols.iter().map(|s| s.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT", "GOOG", "AMZN", "NFLX"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [warehouse]
            path = "/tmp/w.db"

            [provider]
            output_size = "full"

            [[symbols]]
            symbol = "IBM"
            company_name = "IBM"
            "#,
        )
        .unwrap();
        assert_eq!(config.warehouse.path, PathBuf::from("/tmp/w.db"));
        assert_eq!(config.warehouse.busy_timeout_ms, 5_000);
        assert_eq!(config.provider.output_size, OutputSize::Full);
        assert_eq!(config.symbols, vec![SymbolSpec::new("IBM", "IBM")]);
    }

    #[test]
    fn env_overrides_win_over_file() {
        let env: HashMap<&str, &str> = [
            (ENV_WORKING_DIR, "/data/run"),
            (ENV_API_KEY, "secret"),
        ]
        .into_iter()
        .collect();
        let mut config = PipelineConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.paths.working_dir, PathBuf::from("/data/run"));
        assert_eq!(config.provider.api_key, "secret");
        assert_eq!(config.warehouse.path, PathBuf::from("warehouse.db"));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = PipelineConfig::default();
        config.paths.raw_prefix = " ".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.warehouse.enterprise_table = "STG_STOCK_DATA".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.warehouse.staging_table = "stg; DROP TABLE x".into();
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.quality.max_dropped_fraction = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_output_size_is_a_parse_error() {
        let err = PipelineConfig::from_toml("[provider]\noutput_size = \"huge\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = PipelineConfig::from_file(Path::new("/nonexistent/equiflow.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
