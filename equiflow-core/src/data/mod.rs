//! Data acquisition and normalization

pub mod alpha_vantage;
pub mod circuit_breaker;
pub mod fetch;
pub mod ingest;
pub mod normalize;
pub mod provider;
pub mod schema;

pub use alpha_vantage::{AlphaVantageProvider, AlphaVantageSettings, OutputSize};
pub use circuit_breaker::CircuitBreaker;
pub use fetch::{fetch_universe, FetchSummary};
pub use ingest::{parse_csv_batch, read_csv_batch};
pub use normalize::{NormalizeReport, Normalized, Normalizer};
pub use provider::{DataError, FetchProgress, LogProgress, MarketDataProvider, NoProgress, SymbolSpec};
pub use schema::{ColumnMap, Field, SchemaError};
