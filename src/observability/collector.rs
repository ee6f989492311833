// src/observability/collector.rs
//! Run metrics collection
//!
//! Observes two independent streams and never sits on the allocation path:
//!
//! - check completions, folded into per-worker and per-target-group
//!   running aggregates
//! - a fixed-interval process-memory sampler that keeps ticking even while
//!   every check is blocked on allocation
//!
//! `finish` stops the sampler and turns the accumulated state into a
//! `RunReport`.

use crate::observability::report::{
    ConcurrencyReport, GroupComparison, GroupReport, MemoryReport, RunReport, RunSummary,
    SlowCheck, SystemInfo, WorkerReport,
};
use crate::orchestrator::check::{CheckResult, CheckStatus};
use crate::runtime::pool::PoolMetrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ulid::Ulid;

/// How many entries the slowest-checks ledger keeps in the final report
const SLOWEST_CHECKS_KEPT: usize = 5;

/// One process-memory snapshot
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub rss_bytes: u64,
}

#[derive(Debug, Default, Clone)]
struct WorkerAgg {
    checks: u64,
    busy_ms: u64,
}

#[derive(Debug, Default, Clone)]
struct GroupAgg {
    checks: u64,
    total_ms: u64,
}

/// Collects task-lifecycle and resource observations for one run
pub struct MetricsCollector {
    run_id: String,
    started: Instant,
    started_at: DateTime<Utc>,
    sample_interval: Duration,

    samples: Mutex<Vec<MetricsSample>>,
    workers: Mutex<HashMap<usize, WorkerAgg>>,
    groups: Mutex<HashMap<String, GroupAgg>>,
    slowest: Mutex<Vec<SlowCheck>>,

    passed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,

    sampler: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl MetricsCollector {
    pub fn new(sample_interval: Duration) -> Self {
        Self {
            run_id: Ulid::new().to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            sample_interval,
            samples: Mutex::new(Vec::new()),
            workers: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            slowest: Mutex::new(Vec::new()),
            passed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            sampler: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Unique id for this run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Begin periodic memory sampling. One sample is taken immediately.
    pub fn start(self: &Arc<Self>) {
        let mut sampler = self.sampler.lock();
        if sampler.is_some() {
            warn!("Metrics sampler already running, ignoring start");
            return;
        }

        self.take_sample();

        let collector = Arc::clone(self);
        let token = self.shutdown.clone();
        let interval = self.sample_interval;
        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the start sample
            // already covers it
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => collector.take_sample(),
                }
            }
        }));
    }

    fn take_sample(&self) {
        if let Some(rss_bytes) = current_rss_bytes() {
            self.samples.lock().push(MetricsSample {
                timestamp: Utc::now(),
                rss_bytes,
            });
        }
    }

    /// Fold one finished check into the running aggregates
    pub fn record_check(&self, result: &CheckResult) {
        match result.status {
            CheckStatus::Passed => self.passed.fetch_add(1, Ordering::SeqCst),
            CheckStatus::Failed => self.failed.fetch_add(1, Ordering::SeqCst),
            CheckStatus::Skipped => self.skipped.fetch_add(1, Ordering::SeqCst),
        };

        // Skipped checks never executed; only real work feeds the
        // utilization and comparison numbers
        let Some(worker_id) = result.worker_id else {
            return;
        };

        {
            let mut workers = self.workers.lock();
            let agg = workers.entry(worker_id).or_default();
            agg.checks += 1;
            agg.busy_ms += result.duration_ms;
        }
        {
            let mut groups = self.groups.lock();
            let agg = groups.entry(result.target_group.clone()).or_default();
            agg.checks += 1;
            agg.total_ms += result.duration_ms;
        }
        self.slowest.lock().push(SlowCheck {
            title: result.title.clone(),
            target_group: result.target_group.clone(),
            duration_ms: result.duration_ms,
        });

        debug!(
            "Recorded '{}': {:?} in {}ms on worker #{}",
            result.title, result.status, result.duration_ms, worker_id
        );
    }

    /// Stop the sampler and assemble the final report
    pub async fn finish(&self, pools: Vec<PoolMetrics>) -> RunReport {
        self.shutdown.cancel();
        let sampler = self.sampler.lock().take();
        if let Some(handle) = sampler {
            let _ = handle.await;
        }
        self.take_sample();

        let wall_clock_ms = self.started.elapsed().as_millis() as u64;
        let passed = self.passed.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let skipped = self.skipped.load(Ordering::SeqCst);

        let workers = self.worker_reports(wall_clock_ms);
        let total_check_ms: u64 = workers.iter().map(|w| w.busy_ms).sum();
        let worker_count: usize = pools.iter().map(|p| p.capacity).sum();

        let target_groups = self.group_reports(pools);
        let comparison = compare_groups(&target_groups);

        let mut slowest = self.slowest.lock().clone();
        slowest.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        slowest.truncate(SLOWEST_CHECKS_KEPT);

        RunReport {
            summary: RunSummary {
                run_id: self.run_id.clone(),
                total: passed + failed + skipped,
                passed,
                failed,
                skipped,
                wall_clock_ms,
                started_at: self.started_at,
                ended_at: Utc::now(),
            },
            system: SystemInfo::current(),
            workers,
            target_groups,
            comparison,
            memory: self.memory_report(),
            concurrency: ConcurrencyReport::compute(total_check_ms, wall_clock_ms, worker_count),
            slowest_checks: slowest,
        }
    }

    fn worker_reports(&self, wall_clock_ms: u64) -> Vec<WorkerReport> {
        let mut reports: Vec<WorkerReport> = self
            .workers
            .lock()
            .iter()
            .map(|(worker_id, agg)| WorkerReport {
                worker_id: *worker_id,
                checks_completed: agg.checks,
                busy_ms: agg.busy_ms,
                average_ms: if agg.checks == 0 {
                    0.0
                } else {
                    agg.busy_ms as f64 / agg.checks as f64
                },
                utilization: if wall_clock_ms == 0 {
                    0.0
                } else {
                    agg.busy_ms as f64 / wall_clock_ms as f64
                },
            })
            .collect();
        reports.sort_by_key(|report| report.worker_id);
        reports
    }

    fn group_reports(&self, pools: Vec<PoolMetrics>) -> HashMap<String, GroupReport> {
        let aggs = self.groups.lock().clone();
        let mut reports: HashMap<String, GroupReport> = HashMap::new();

        // Every pool appears, even if no check touched it
        for pool in pools {
            let agg = aggs.get(&pool.target_group).cloned().unwrap_or_default();
            reports.insert(
                pool.target_group.clone(),
                GroupReport {
                    checks_completed: agg.checks,
                    total_ms: agg.total_ms,
                    average_ms: if agg.checks == 0 {
                        0.0
                    } else {
                        agg.total_ms as f64 / agg.checks as f64
                    },
                    pool: Some(pool),
                },
            );
        }

        // Aggregates whose pool is already gone still get reported
        for (group, agg) in aggs {
            reports.entry(group).or_insert(GroupReport {
                checks_completed: agg.checks,
                total_ms: agg.total_ms,
                average_ms: if agg.checks == 0 {
                    0.0
                } else {
                    agg.total_ms as f64 / agg.checks as f64
                },
                pool: None,
            });
        }

        reports
    }

    fn memory_report(&self) -> MemoryReport {
        let samples = self.samples.lock();
        let peak = samples.iter().map(|s| s.rss_bytes).max().unwrap_or(0);
        let average = if samples.is_empty() {
            0
        } else {
            samples.iter().map(|s| s.rss_bytes).sum::<u64>() / samples.len() as u64
        };

        MemoryReport {
            samples: samples.len(),
            peak_rss_bytes: peak,
            average_rss_bytes: average,
        }
    }
}

/// Fastest vs slowest group by average check duration. Needs at least two
/// groups that actually ran checks.
fn compare_groups(groups: &HashMap<String, GroupReport>) -> Option<GroupComparison> {
    let mut averages: Vec<(&String, f64)> = groups
        .iter()
        .filter(|(_, report)| report.checks_completed > 0)
        .map(|(group, report)| (group, report.average_ms))
        .collect();
    if averages.len() < 2 {
        return None;
    }

    averages.sort_by(|a, b| {
        a.1.partial_cmp(&b.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    let (faster_group, faster_average_ms) = (averages[0].0.clone(), averages[0].1);
    let (slower_group, slower_average_ms) = {
        let last = averages.last().unwrap();
        (last.0.clone(), last.1)
    };

    let margin_ms = slower_average_ms - faster_average_ms;
    let margin_pct = if slower_average_ms == 0.0 {
        0.0
    } else {
        margin_ms / slower_average_ms * 100.0
    };

    Some(GroupComparison {
        faster_group,
        slower_group,
        faster_average_ms,
        slower_average_ms,
        margin_ms,
        margin_pct,
    })
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> Option<u64> {
    // /proc/self/statm reports sizes in pages; assume 4 KiB pages
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> Option<u64> {
    None
}
