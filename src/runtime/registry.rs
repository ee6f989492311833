// src/runtime/registry.rs
//! Pool registry
//!
//! One `SessionPool` per target group behind a single allocate/release
//! facade. The registry is constructed once by the run's entry point and
//! passed by reference to the orchestrator; nothing reaches it through
//! globals.

use crate::runtime::pool::{PoolConfig, PoolMetrics, SessionPool};
use crate::runtime::session::Session;
use crate::utils::errors::{EngineError, Result};
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns one session pool per target group
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<SessionPool>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and retain a pool for a target group.
    ///
    /// Idempotent with a warning: re-initializing an existing group is a
    /// no-op.
    pub async fn initialize_pool(&self, target_group: &str, config: PoolConfig) -> Result<()> {
        if self.pools.read().contains_key(target_group) {
            warn!(
                "Pool for target group '{}' already initialized, ignoring",
                target_group
            );
            return Ok(());
        }

        let pool = Arc::new(SessionPool::initialize(target_group, config).await?);

        let raced = {
            let mut pools = self.pools.write();
            if pools.contains_key(target_group) {
                Some(pool)
            } else {
                pools.insert(target_group.to_string(), pool);
                None
            }
        };

        // Lost an initialization race; tear the extra pool down
        if let Some(extra) = raced {
            warn!(
                "Pool for target group '{}' initialized concurrently, discarding duplicate",
                target_group
            );
            let _ = extra.destroy().await;
        }

        Ok(())
    }

    /// Number of initialized pools
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Target groups with an initialized pool, sorted for determinism
    pub fn target_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.pools.read().keys().cloned().collect();
        groups.sort();
        groups
    }

    fn pool(&self, target_group: &str) -> Result<Arc<SessionPool>> {
        self.pools
            .read()
            .get(target_group)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTargetGroup(target_group.to_string()))
    }

    /// Allocate a session from the named group's pool
    pub async fn allocate(
        &self,
        target_group: &str,
        check_title: &str,
        timeout: Option<Duration>,
    ) -> Result<Session> {
        self.pool(target_group)?.allocate(check_title, timeout).await
    }

    /// Return a session to the named group's pool
    pub async fn release(&self, target_group: &str, session: Session) -> Result<()> {
        self.pool(target_group)?.release(session).await;
        Ok(())
    }

    /// Cancellation token for checks running against the named group
    pub fn cancellation_token(&self, target_group: &str) -> Result<CancellationToken> {
        Ok(self.pool(target_group)?.cancellation_token())
    }

    /// One metrics snapshot per group, sorted by group for determinism
    pub async fn all_metrics(&self) -> Vec<PoolMetrics> {
        let pools: Vec<Arc<SessionPool>> = {
            let mut entries: Vec<_> = self
                .pools
                .read()
                .iter()
                .map(|(group, pool)| (group.clone(), Arc::clone(pool)))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries.into_iter().map(|(_, pool)| pool).collect()
        };

        let mut metrics = Vec::with_capacity(pools.len());
        for pool in pools {
            metrics.push(pool.metrics().await);
        }
        metrics
    }

    /// Destroy every pool concurrently. Best-effort: individual failures
    /// are collected and returned, never block the other pools.
    pub async fn destroy_all(&self) -> Vec<(String, EngineError)> {
        let pools: Vec<Arc<SessionPool>> = self.pools.read().values().cloned().collect();
        info!("Destroying {} session pools", pools.len());

        let outcomes = join_all(pools.iter().map(|pool| pool.destroy())).await;

        let mut errors = Vec::new();
        for (pool, outcome) in pools.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(
                    "Failed to destroy pool for '{}': {}",
                    pool.target_group(),
                    e
                );
                errors.push((pool.target_group().to_string(), e));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::HostConfig;

    fn cat_pool_config(capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            host: HostConfig {
                command: "cat".to_string(),
                args: vec![],
                headless: true,
                env: vec![],
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_target_group() {
        let registry = PoolRegistry::new();

        let result = registry.allocate("ghost", "check", None).await;
        assert!(matches!(result, Err(EngineError::UnknownTargetGroup(_))));
    }

    #[tokio::test]
    async fn test_routing_roundtrip() {
        let registry = PoolRegistry::new();
        registry
            .initialize_pool("gateway-a", cat_pool_config(2))
            .await
            .unwrap();

        let session = registry
            .allocate("gateway-a", "authorize", None)
            .await
            .unwrap();
        assert_eq!(session.target_group(), "gateway-a");
        registry.release("gateway-a", session).await.unwrap();

        let metrics = registry.all_metrics().await;
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].total_allocations, 1);

        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn test_reinitialization_is_noop() {
        let registry = PoolRegistry::new();
        registry
            .initialize_pool("gateway-a", cat_pool_config(2))
            .await
            .unwrap();

        let session = registry.allocate("gateway-a", "held", None).await.unwrap();

        // Second init must not replace the pool out from under the session
        registry
            .initialize_pool("gateway-a", cat_pool_config(8))
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.all_metrics().await[0].capacity, 2);

        registry.release("gateway-a", session).await.unwrap();
        registry.destroy_all().await;
    }

    #[tokio::test]
    async fn test_destroy_all_is_best_effort_and_repeatable() {
        let registry = PoolRegistry::new();
        registry
            .initialize_pool("gateway-a", cat_pool_config(1))
            .await
            .unwrap();
        registry
            .initialize_pool("gateway-b", cat_pool_config(1))
            .await
            .unwrap();

        let errors = registry.destroy_all().await;
        assert!(errors.is_empty());

        // Pools stay registered but destroyed; a second pass is harmless
        let errors = registry.destroy_all().await;
        assert!(errors.is_empty());

        let result = registry.allocate("gateway-a", "late", None).await;
        assert!(matches!(result, Err(EngineError::PoolDestroyed { .. })));
    }

    #[tokio::test]
    async fn test_target_groups_sorted() {
        let registry = PoolRegistry::new();
        registry
            .initialize_pool("gateway-b", cat_pool_config(1))
            .await
            .unwrap();
        registry
            .initialize_pool("gateway-a", cat_pool_config(1))
            .await
            .unwrap();

        assert_eq!(registry.target_groups(), vec!["gateway-a", "gateway-b"]);
        registry.destroy_all().await;
    }
}
