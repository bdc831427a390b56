//! Derived analytics: return series and per-symbol summaries.

pub mod aggregate;
pub mod returns;

pub use aggregate::{aggregate, PerformanceStats, TrailingAverages, LONG_WINDOW, SHORT_WINDOW};
pub use returns::{compute_returns, pct_change};
