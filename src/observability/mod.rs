// src/observability/mod.rs
//! Metrics, reporting, and logging
//!
//! - **collector**: per-run metrics collection (check aggregates + memory
//!   sampler)
//! - **report**: the JSON run report and console summary
//!
//! The collector observes; it never sits on the allocation path.

pub mod collector;
pub mod report;

pub use collector::{MetricsCollector, MetricsSample};
pub use report::{write_report, RunReport};

use crate::utils::errors::{EngineError, Result};
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| EngineError::RuntimeError(format!("failed to initialize tracing: {}", e)))
}
