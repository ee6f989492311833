// src/orchestrator/phased.rs
//! Phased check orchestration
//!
//! Drives a run through its four states:
//!
//! ```text
//! Discovering → SetupPhase → ParallelPhase → Done
//! ```
//!
//! Setup checks run strictly in ascending order within their target group
//! (groups bootstrap concurrently with each other); no parallel check
//! starts anywhere until every group finished its setup list. The parallel
//! phase dispatches everything at once; the only concurrency bound is
//! each pool's admission control.
//!
//! Every check follows allocate → run → record → release, with the release
//! guaranteed even when the body errors or panics. Failures never
//! propagate across checks.

use crate::observability::collector::MetricsCollector;
use crate::orchestrator::check::{
    CheckDefinition, CheckPhase, CheckRegistry, CheckResult, CheckStatus,
};
use crate::runtime::registry::PoolRegistry;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Discovering,
    SetupPhase,
    ParallelPhase,
    Done,
}

/// Deterministic execution plan produced by discovery
#[derive(Debug)]
pub struct RunPlan {
    /// Per-group setup lists, sorted by group and by order within a group
    pub setup: Vec<(String, Vec<CheckDefinition>)>,

    /// Parallel checks in registration order
    pub parallel: Vec<CheckDefinition>,
}

impl RunPlan {
    pub fn setup_count(&self) -> usize {
        self.setup.iter().map(|(_, checks)| checks.len()).sum()
    }

    pub fn total(&self) -> usize {
        self.setup_count() + self.parallel.len()
    }
}

/// Drives registered checks through the setup and parallel phases
pub struct CheckOrchestrator {
    registry: Arc<PoolRegistry>,
    metrics: Arc<MetricsCollector>,
    checks: CheckRegistry,

    /// Target groups admitted to this run; checks for other groups are
    /// left out of the plan
    target_groups: Vec<String>,

    /// Optional cap on how long a check may wait for a session
    allocation_timeout: Option<Duration>,

    phase: Mutex<RunPhase>,

    /// Append-only log of finished checks
    results: Mutex<Vec<CheckResult>>,

    completed: AtomicUsize,
    total: AtomicUsize,
}

impl CheckOrchestrator {
    pub fn new(
        registry: Arc<PoolRegistry>,
        metrics: Arc<MetricsCollector>,
        checks: CheckRegistry,
        target_groups: Vec<String>,
        allocation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            metrics,
            checks,
            target_groups,
            allocation_timeout,
            phase: Mutex::new(RunPhase::Discovering),
            results: Mutex::new(Vec::new()),
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    /// Current run state
    pub fn phase(&self) -> RunPhase {
        *self.phase.lock()
    }

    /// Snapshot of the results accumulated so far
    pub fn results(&self) -> Vec<CheckResult> {
        self.results.lock().clone()
    }

    /// Build the execution plan from the static check registry.
    ///
    /// Deterministic for identical inputs: groups are sorted, setup lists
    /// are sorted by order, parallel checks keep registration order.
    /// Duplicate setup orders within a group are rejected.
    pub fn discover(&self) -> Result<RunPlan> {
        let mut setup: BTreeMap<String, Vec<CheckDefinition>> = BTreeMap::new();
        let mut parallel = Vec::new();
        let mut seen_orders: HashSet<(String, u32)> = HashSet::new();

        for check in self.checks.checks() {
            if !self.target_groups.contains(&check.target_group) {
                debug!(
                    "Leaving '{}' out of the plan: target group '{}' not in this run",
                    check.title, check.target_group
                );
                continue;
            }

            match check.phase {
                CheckPhase::Setup { order } => {
                    if !seen_orders.insert((check.target_group.clone(), order)) {
                        return Err(EngineError::InvalidCheckDefinition(format!(
                            "duplicate setup order {} in target group '{}' ('{}')",
                            order, check.target_group, check.title
                        )));
                    }
                    setup.entry(check.target_group.clone()).or_default().push(check.clone());
                }
                CheckPhase::Parallel => parallel.push(check.clone()),
            }
        }

        for checks in setup.values_mut() {
            checks.sort_by_key(|check| match check.phase {
                CheckPhase::Setup { order } => order,
                CheckPhase::Parallel => u32::MAX,
            });
        }

        let plan = RunPlan {
            setup: setup.into_iter().collect(),
            parallel,
        };
        info!(
            "Discovered {} checks ({} setup, {} parallel) across {} target groups",
            plan.total(),
            plan.setup_count(),
            plan.parallel.len(),
            self.target_groups.len()
        );
        Ok(plan)
    }

    /// Run both phases in order and return the accumulated results
    pub async fn execute(&self) -> Result<Vec<CheckResult>> {
        let plan = self.discover()?;
        self.total.store(plan.total(), Ordering::SeqCst);

        self.set_phase(RunPhase::SetupPhase);
        self.execute_setup_phase(&plan).await;

        self.set_phase(RunPhase::ParallelPhase);
        self.execute_parallel_phase(&plan).await;

        self.set_phase(RunPhase::Done);
        Ok(self.results())
    }

    /// Bootstrap every group concurrently; within a group, strictly
    /// sequential in ascending order. A failed setup check does not
    /// short-circuit the rest of its group's list.
    async fn execute_setup_phase(&self, plan: &RunPlan) {
        join_all(plan.setup.iter().map(|(group, checks)| async move {
            debug!("Running {} setup checks for '{}'", checks.len(), group);
            for check in checks {
                let result = self.run_check(check).await;
                self.record(result);
            }
        }))
        .await;
    }

    /// Dispatch every parallel check at once; pool admission control is
    /// the only concurrency bound.
    async fn execute_parallel_phase(&self, plan: &RunPlan) {
        join_all(plan.parallel.iter().map(|check| async move {
            let result = self.run_check(check).await;
            self.record(result);
        }))
        .await;
    }

    /// allocate → run body → release, with the release guaranteed even on
    /// body errors and panics. Allocation failures record the check as
    /// skipped; body failures as failed. Nothing propagates to siblings.
    async fn run_check(&self, check: &CheckDefinition) -> CheckResult {
        let started_at = Utc::now();
        let started = Instant::now();

        let mut session = match self
            .registry
            .allocate(&check.target_group, &check.title, self.allocation_timeout)
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("Skipping '{}': {}", check.title, e);
                return CheckResult {
                    title: check.title.clone(),
                    target_group: check.target_group.clone(),
                    source_ref: check.source_ref.clone(),
                    phase: check.phase,
                    status: CheckStatus::Skipped,
                    duration_ms: started.elapsed().as_millis() as u64,
                    started_at,
                    ended_at: Utc::now(),
                    error: Some(e.to_string()),
                    worker_id: None,
                };
            }
        };

        let worker_id = session.id();
        let cancel = self
            .registry
            .cancellation_token(&check.target_group)
            .unwrap_or_default();

        let outcome = AssertUnwindSafe(check.body.run(&mut session, cancel))
            .catch_unwind()
            .await;

        let (status, error) = match outcome {
            Ok(Ok(())) => (CheckStatus::Passed, None),
            Ok(Err(e)) => (CheckStatus::Failed, Some(format!("{:#}", e))),
            Err(payload) => (
                CheckStatus::Failed,
                Some(format!("check panicked: {}", panic_message(payload))),
            ),
        };

        if let Err(e) = self.registry.release(&check.target_group, session).await {
            warn!(
                "Failed to return session to '{}': {}",
                check.target_group, e
            );
        }

        CheckResult {
            title: check.title.clone(),
            target_group: check.target_group.clone(),
            source_ref: check.source_ref.clone(),
            phase: check.phase,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
            started_at,
            ended_at: Utc::now(),
            error,
            worker_id: Some(worker_id),
        }
    }

    /// Feed the collector, log progress, append to the results log
    fn record(&self, result: CheckResult) {
        self.metrics.record_check(&result);

        match result.status {
            CheckStatus::Passed => debug!("'{}' passed in {}ms", result.title, result.duration_ms),
            CheckStatus::Failed => warn!(
                "'{}' failed in {}ms: {}",
                result.title,
                result.duration_ms,
                result.error.as_deref().unwrap_or("unknown error")
            ),
            CheckStatus::Skipped => {}
        }

        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let total = self.total.load(Ordering::SeqCst);
        if total > 0 {
            info!("Progress: {}/{} ({}%)", done, total, done * 100 / total);
        }

        self.results.lock().push(result);
    }

    fn set_phase(&self, phase: RunPhase) {
        info!("Run phase: {:?}", phase);
        *self.phase.lock() = phase;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
