// src/orchestrator/check.rs
//! Check definitions, registry, and results
//!
//! Checks are registered statically into a `CheckRegistry`; there is no
//! filesystem discovery, so the orchestrator is decoupled from any storage
//! layout. A check body is an async trait object that receives the mutable
//! session it was allocated plus a cancellation token.

use crate::runtime::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which phase a check runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckPhase {
    /// Ordered per-group bootstrap; runs before any parallel check
    Setup { order: u32 },

    /// Bulk workload, dispatched all at once under pool admission control
    Parallel,
}

/// Executable body of a check.
///
/// Implementations get exclusive access to the session for the duration of
/// the call. The token is cancelled when the session's pool is destroyed;
/// bodies that ignore it simply lose their context when the host goes away.
#[async_trait]
pub trait CheckBody: Send + Sync {
    async fn run(&self, session: &mut Session, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// One registered check
#[derive(Clone)]
pub struct CheckDefinition {
    /// Where the check came from (module path, scenario name)
    pub source_ref: String,

    /// Human-readable title, also used for allocation bookkeeping
    pub title: String,

    /// Target group whose pool serves this check
    pub target_group: String,

    pub phase: CheckPhase,

    pub body: Arc<dyn CheckBody>,
}

impl CheckDefinition {
    /// Define an ordered setup-phase check
    pub fn setup(
        source_ref: impl Into<String>,
        title: impl Into<String>,
        target_group: impl Into<String>,
        order: u32,
        body: impl CheckBody + 'static,
    ) -> Self {
        Self {
            source_ref: source_ref.into(),
            title: title.into(),
            target_group: target_group.into(),
            phase: CheckPhase::Setup { order },
            body: Arc::new(body),
        }
    }

    /// Define a parallel-phase check
    pub fn parallel(
        source_ref: impl Into<String>,
        title: impl Into<String>,
        target_group: impl Into<String>,
        body: impl CheckBody + 'static,
    ) -> Self {
        Self {
            source_ref: source_ref.into(),
            title: title.into(),
            target_group: target_group.into(),
            phase: CheckPhase::Parallel,
            body: Arc::new(body),
        }
    }
}

impl fmt::Debug for CheckDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckDefinition")
            .field("source_ref", &self.source_ref)
            .field("title", &self.title)
            .field("target_group", &self.target_group)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Final status of a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    /// Never executed (no session could be allocated)
    Skipped,
}

/// Immutable record of one finished check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub title: String,
    pub target_group: String,
    pub source_ref: String,
    pub phase: CheckPhase,
    pub status: CheckStatus,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    /// Error text for failed or skipped checks
    pub error: Option<String>,

    /// Id of the session that executed the check, absent when skipped
    pub worker_id: Option<usize>,
}

/// Statically built list of checks for a run
#[derive(Default)]
pub struct CheckRegistry {
    checks: Vec<CheckDefinition>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a check. Registration order is preserved and, together with the
    /// setup orders, makes planning deterministic.
    pub fn register(&mut self, check: CheckDefinition) {
        debug!(
            "Registered {:?} check '{}' for '{}'",
            check.phase, check.title, check.target_group
        );
        self.checks.push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn checks(&self) -> &[CheckDefinition] {
        &self.checks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCheck;

    #[async_trait]
    impl CheckBody for NoopCheck {
        async fn run(
            &self,
            _session: &mut Session,
            _cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_registry_preserves_order() {
        let mut registry = CheckRegistry::new();
        assert!(registry.is_empty());

        registry.register(CheckDefinition::setup(
            "checks/boot.rs",
            "create merchant",
            "gateway-a",
            0,
            NoopCheck,
        ));
        registry.register(CheckDefinition::parallel(
            "checks/auth.rs",
            "authorize visa",
            "gateway-a",
            NoopCheck,
        ));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.checks()[0].title, "create merchant");
        assert_eq!(registry.checks()[0].phase, CheckPhase::Setup { order: 0 });
        assert_eq!(registry.checks()[1].phase, CheckPhase::Parallel);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&CheckStatus::Passed).unwrap(),
            "\"passed\""
        );
        assert_eq!(
            serde_json::to_string(&CheckStatus::Skipped).unwrap(),
            "\"skipped\""
        );
    }
}
