// src/observability/report.rs
//! Run reports
//!
//! One JSON-serializable report per run, assembled by the metrics
//! collector when the run ends. Writing it to disk and printing the
//! condensed console summary are the only I/O in this module.

use crate::utils::errors::{EngineError, Result};
use crate::runtime::pool::PoolMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

/// Totals for the whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub wall_clock_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Where the run happened
#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub engine_version: String,
    pub os: String,
    pub arch: String,
    pub pid: u32,
}

impl SystemInfo {
    pub fn current() -> Self {
        Self {
            engine_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pid: std::process::id(),
        }
    }
}

/// Per-session (worker) aggregate
#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub checks_completed: u64,
    pub busy_ms: u64,
    pub average_ms: f64,

    /// Busy time over run wall-clock time
    pub utilization: f64,
}

/// Per-target-group aggregate
#[derive(Debug, Clone, Serialize)]
pub struct GroupReport {
    pub checks_completed: u64,
    pub total_ms: u64,
    pub average_ms: f64,
    pub pool: Option<PoolMetrics>,
}

/// Which target group averaged faster, and by how much
#[derive(Debug, Clone, Serialize)]
pub struct GroupComparison {
    pub faster_group: String,
    pub slower_group: String,
    pub faster_average_ms: f64,
    pub slower_average_ms: f64,
    pub margin_ms: f64,
    pub margin_pct: f64,
}

/// Process-memory aggregates from the periodic sampler
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub samples: usize,
    pub peak_rss_bytes: u64,
    pub average_rss_bytes: u64,
}

/// Parallelism achieved by the run
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyReport {
    /// Sum of every executed check's duration
    pub total_check_ms: u64,

    pub wall_clock_ms: u64,

    /// total_check_ms over wall_clock_ms
    pub speedup: f64,

    /// Sessions available across all pools
    pub workers: usize,

    /// speedup over worker count
    pub efficiency: f64,
}

impl ConcurrencyReport {
    pub fn compute(total_check_ms: u64, wall_clock_ms: u64, workers: usize) -> Self {
        let speedup = if wall_clock_ms == 0 {
            0.0
        } else {
            total_check_ms as f64 / wall_clock_ms as f64
        };
        let efficiency = if workers == 0 {
            0.0
        } else {
            speedup / workers as f64
        };

        Self {
            total_check_ms,
            wall_clock_ms,
            speedup,
            workers,
            efficiency,
        }
    }
}

/// One entry in the slowest-checks ledger
#[derive(Debug, Clone, Serialize)]
pub struct SlowCheck {
    pub title: String,
    pub target_group: String,
    pub duration_ms: u64,
}

/// The complete per-run report
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub system: SystemInfo,
    pub workers: Vec<WorkerReport>,
    pub target_groups: HashMap<String, GroupReport>,
    pub comparison: Option<GroupComparison>,
    pub memory: MemoryReport,
    pub concurrency: ConcurrencyReport,
    pub slowest_checks: Vec<SlowCheck>,
}

impl RunReport {
    /// Print the condensed console summary
    pub fn log_summary(&self) {
        info!(
            "Run {} finished: {} checks ({} passed, {} failed, {} skipped) in {}ms",
            self.summary.run_id,
            self.summary.total,
            self.summary.passed,
            self.summary.failed,
            self.summary.skipped,
            self.summary.wall_clock_ms
        );
        info!(
            "Concurrency: {:.2}x speedup across {} workers ({:.0}% efficiency)",
            self.concurrency.speedup,
            self.concurrency.workers,
            self.concurrency.efficiency * 100.0
        );
        if self.memory.samples > 0 {
            info!(
                "Memory: peak {:.1} MB, average {:.1} MB over {} samples",
                self.memory.peak_rss_bytes as f64 / (1024.0 * 1024.0),
                self.memory.average_rss_bytes as f64 / (1024.0 * 1024.0),
                self.memory.samples
            );
        }
        if let Some(comparison) = &self.comparison {
            info!(
                "Fastest target group '{}' ({:.0}ms avg) beat '{}' ({:.0}ms avg) by {:.0}%",
                comparison.faster_group,
                comparison.faster_average_ms,
                comparison.slower_group,
                comparison.slower_average_ms,
                comparison.margin_pct
            );
        }
        for slow in &self.slowest_checks {
            info!(
                "Slowest: '{}' [{}] took {}ms",
                slow.title, slow.target_group, slow.duration_ms
            );
        }
    }
}

/// Write the report as pretty JSON
pub fn write_report(path: impl AsRef<Path>, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| EngineError::ExportFailed(format!("JSON serialization error: {}", e)))?;
    std::fs::write(path.as_ref(), json)
        .map_err(|e| EngineError::ExportFailed(format!("write error: {}", e)))?;

    info!("Run report written to {}", path.as_ref().display());
    Ok(())
}
