// src/main.rs
//! Tollgate Engine
//!
//! Runs registered conformance checks against upstream payment gateways
//! through pooled sandboxed sessions. The bare binary registers a small set
//! of built-in smoke checks per target group so a plain run exercises the
//! whole pipeline: pool initialization, phased orchestration, metrics, and
//! the report sink.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tollgate_engine::observability::{init_tracing, write_report, MetricsCollector};
use tollgate_engine::orchestrator::{CheckBody, CheckDefinition, CheckOrchestrator, CheckRegistry};
use tollgate_engine::runtime::{PoolRegistry, Session};
use tollgate_engine::utils::config::EngineConfig;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    info!("Starting Tollgate engine v{}", tollgate_engine::VERSION);

    let config = EngineConfig::load()?;
    if !config.enabled {
        info!("Engine disabled by configuration, exiting");
        return Ok(());
    }
    if config.target_groups.is_empty() {
        info!("No target groups configured, nothing to run");
        return Ok(());
    }

    // One pool per target group; host spawn failure aborts the run
    let registry = Arc::new(PoolRegistry::new());
    for group in &config.target_groups {
        registry.initialize_pool(group, config.pool_config()).await?;
    }

    let metrics = Arc::new(MetricsCollector::new(config.sample_interval()));
    metrics.start();

    let orchestrator = CheckOrchestrator::new(
        Arc::clone(&registry),
        Arc::clone(&metrics),
        smoke_checks(&config.target_groups),
        config.target_groups.clone(),
        config.allocation_timeout(),
    );
    let run = orchestrator.execute().await;

    let report = metrics.finish(registry.all_metrics().await).await;
    report.log_summary();
    if let Err(e) = write_report(&config.report_path, &report) {
        error!("Failed to write run report: {}", e);
    }

    for (group, e) in registry.destroy_all().await {
        warn!("Teardown error for '{}': {}", group, e);
    }

    run?;
    Ok(())
}

/// Built-in smoke checks: one ordered warmup per group plus a pair of
/// parallel echo checks exercising session scratch state and cancellation.
fn smoke_checks(target_groups: &[String]) -> CheckRegistry {
    let mut registry = CheckRegistry::new();
    for group in target_groups {
        registry.register(CheckDefinition::setup(
            "smoke/warmup",
            format!("warm up {}", group),
            group.clone(),
            0,
            WarmupCheck,
        ));
        for payload in ["card-present", "card-absent"] {
            registry.register(CheckDefinition::parallel(
                "smoke/echo",
                format!("echo {} against {}", payload, group),
                group.clone(),
                EchoCheck { payload },
            ));
        }
    }
    registry
}

/// Primes a fresh session with run-scoped state
struct WarmupCheck;

#[async_trait]
impl CheckBody for WarmupCheck {
    async fn run(&self, session: &mut Session, _cancel: CancellationToken) -> Result<()> {
        session.put_storage("warmed_up_at", chrono::Utc::now().to_rfc3339());
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}

/// Round-trips scratch state through an allocated session
struct EchoCheck {
    payload: &'static str,
}

#[async_trait]
impl CheckBody for EchoCheck {
    async fn run(&self, session: &mut Session, cancel: CancellationToken) -> Result<()> {
        session.set_cookie("smoke", self.payload);

        tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("cancelled mid-check"),
            _ = tokio::time::sleep(Duration::from_millis(25)) => {}
        }

        anyhow::ensure!(
            session.cookie("smoke") == Some(self.payload),
            "scratch state lost while the check held the session"
        );
        Ok(())
    }
}
