//! Domain types for the equity price pipeline

pub mod record;
pub mod summary;

pub use record::{NormalizedRecord, RawBatch, ReturnRecord, WarehouseRow};
pub use summary::SymbolSummary;
