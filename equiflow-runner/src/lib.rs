//! Equiflow Runner: drives the daily price pipeline end to end.
//!
//! This crate builds on `equiflow-core` to provide:
//! - TOML configuration with environment overrides
//! - Run identifiers and the per-run state machine
//! - The artifact store (per-run directory plus `manifest.json`)
//! - The SQLite staging/enterprise warehouse and its upsert merge
//! - The pipeline driver and logging setup

pub mod artifacts;
pub mod config;
pub mod logging;
pub mod pipeline;
pub mod run_id;
pub mod state;
pub mod warehouse;

pub use artifacts::{ArtifactEntry, ArtifactError, ArtifactKind, ArtifactStore, RunManifest};
pub use config::{ConfigError, PipelineConfig, QualityConfig, WarehouseConfig};
pub use logging::{init_logging, LoggingError};
pub use pipeline::{Pipeline, PipelineError, RunFailure, RunReport};
pub use run_id::RunId;
pub use state::{PipelineStage, PipelineState, TransitionError};
pub use warehouse::{init_warehouse, MergeReport, SqliteWarehouse, UpsertStore, WarehouseError};
