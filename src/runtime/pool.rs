// src/runtime/pool.rs
//! Fixed-capacity session pools
//!
//! One pool per target group. A pool owns one sandbox host plus exactly
//! `capacity` reusable sessions, and is the only place session state
//! transitions happen.
//!
//! ```text
//! SessionPool
//! ├─ Idle:    [Session 1, Session 2, ...]   (ready to allocate)
//! ├─ Held:    moved out to the running checks
//! └─ Waiters: FIFO queue behind a fair semaphore
//! ```
//!
//! Admission control is a fair `tokio::sync::Semaphore`: waiters are served
//! strictly in arrival order, so a request enqueued before another is never
//! fulfilled later. `allocate` moves a `Session` out of the pool and
//! `release` moves it back, which is what makes "at most one holder per
//! session" hold without any lock around the session itself.

use crate::runtime::host::{HostConfig, SandboxHost};
use crate::runtime::session::Session;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What to do when session sanitization fails during release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Log, count, and return the session to service anyway. Availability
    /// over guaranteed-clean state.
    #[default]
    BestEffort,

    /// Close the dirty session and open a replacement context in its place
    DiscardOnFailure,
}

/// Configuration for one session pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of sessions, fixed at initialization
    pub capacity: usize,

    /// Sandbox host configuration
    pub host: HostConfig,

    /// Sanitization failure policy
    pub cleanup_policy: CleanupPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            host: HostConfig::default(),
            cleanup_policy: CleanupPolicy::BestEffort,
        }
    }
}

/// Read-only pool metrics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    /// Target group this pool serves
    pub target_group: String,

    /// Fixed session capacity
    pub capacity: usize,

    /// Sessions currently held by checks
    pub active: usize,

    /// Sessions currently idle in the pool
    pub idle: usize,

    /// Lifetime allocation count
    pub total_allocations: u64,

    /// Mean allocations per session
    pub average_reuse: f64,

    /// Highest number of simultaneously held sessions observed
    pub peak_concurrent: usize,

    /// How long initialization took (host spawn + context creation)
    pub creation_time_ms: u64,

    /// Sanitization failures absorbed by the cleanup policy
    pub sanitize_failures: u64,
}

/// Fixed-capacity pool of sandboxed sessions for one target group
pub struct SessionPool {
    target_group: String,
    capacity: usize,
    cleanup_policy: CleanupPolicy,

    /// The out-of-process host containing this pool's contexts
    host: SandboxHost,

    /// Idle sessions; a permit is held for every session outside this set
    idle: Mutex<Vec<Session>>,

    /// Fair admission semaphore, one permit per idle session
    permits: Semaphore,

    /// Allocation requests currently queued behind the semaphore
    waiting: AtomicUsize,

    /// Set once by destroy
    destroyed: AtomicBool,

    /// Cancelled by destroy before the host is force-closed
    cancel: CancellationToken,

    /// Context ids for replacement sessions under DiscardOnFailure
    next_context_id: AtomicUsize,

    total_allocations: AtomicU64,
    peak_concurrent: AtomicUsize,
    sanitize_failures: AtomicU64,
    creation_time_ms: u64,
}

impl SessionPool {
    /// Spawn the sandbox host and open `capacity` session contexts.
    ///
    /// Host spawn failure propagates and aborts the run. A context-creation
    /// failure is not retried; the partially built pool is dropped (the
    /// host goes with it) and the error propagates.
    pub async fn initialize(target_group: &str, config: PoolConfig) -> Result<Self> {
        let started = Instant::now();
        info!(
            "Initializing session pool for '{}' with capacity {}",
            target_group, config.capacity
        );

        let host = SandboxHost::spawn(target_group, config.host).await?;

        let mut sessions = Vec::with_capacity(config.capacity);
        for context_id in 1..=config.capacity {
            host.open_context(context_id).await?;
            sessions.push(Session::new(context_id, target_group.to_string()));
        }

        let creation_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Session pool for '{}' ready in {}ms",
            target_group, creation_time_ms
        );

        Ok(Self {
            target_group: target_group.to_string(),
            capacity: config.capacity,
            cleanup_policy: config.cleanup_policy,
            host,
            permits: Semaphore::new(config.capacity),
            idle: Mutex::new(sessions),
            waiting: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            next_context_id: AtomicUsize::new(config.capacity + 1),
            total_allocations: AtomicU64::new(0),
            peak_concurrent: AtomicUsize::new(0),
            sanitize_failures: AtomicU64::new(0),
            creation_time_ms,
        })
    }

    /// Target group this pool serves
    pub fn target_group(&self) -> &str {
        &self.target_group
    }

    /// Fixed session capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A child of the pool's cancellation token, for handing to check
    /// bodies. Cancelled by `destroy` before the host is force-closed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Take a session out of the pool, waiting FIFO-fair if none is idle.
    ///
    /// With `timeout: None` the caller waits indefinitely. An explicit
    /// timeout surfaces as `AllocationTimeout`; a pool destroyed while the
    /// caller waits surfaces as `PoolDestroyed` instead of hanging.
    pub async fn allocate(&self, check_title: &str, timeout: Option<Duration>) -> Result<Session> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(self.destroyed_error());
        }

        let permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(self.destroyed_error()),
            Err(TryAcquireError::NoPermits) => {
                debug!(
                    "All {} sessions for '{}' busy, queueing '{}'",
                    self.capacity, self.target_group, check_title
                );
                self.waiting.fetch_add(1, Ordering::SeqCst);

                let acquired = match timeout {
                    Some(limit) => {
                        match tokio::time::timeout(limit, self.permits.acquire()).await {
                            Ok(acquired) => acquired,
                            Err(_) => {
                                self.waiting.fetch_sub(1, Ordering::SeqCst);
                                return Err(EngineError::AllocationTimeout {
                                    target_group: self.target_group.clone(),
                                    waited_ms: limit.as_millis() as u64,
                                });
                            }
                        }
                    }
                    None => self.permits.acquire().await,
                };
                self.waiting.fetch_sub(1, Ordering::SeqCst);

                match acquired {
                    Ok(permit) => permit,
                    // Semaphore closed: the pool was destroyed underneath us
                    Err(_) => return Err(self.destroyed_error()),
                }
            }
        };
        permit.forget();

        let mut session = {
            let mut idle = self.idle.lock().await;
            let Some(session) = idle.pop() else {
                warn!(
                    "Pool for '{}' held a permit but had no idle session",
                    self.target_group
                );
                return Err(self.destroyed_error());
            };
            let active = self.capacity - idle.len();
            self.peak_concurrent.fetch_max(active, Ordering::SeqCst);
            session
        };

        session.mark_allocated(check_title);
        self.total_allocations.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Allocated session #{} in '{}' to '{}' (use {})",
            session.id(),
            self.target_group,
            check_title,
            session.usage_count()
        );

        Ok(session)
    }

    /// Sanitize a session and hand it to the oldest waiter, or park it
    /// idle. Never fails: sanitization problems are absorbed by the
    /// configured cleanup policy.
    pub async fn release(&self, mut session: Session) {
        if self.destroyed.load(Ordering::SeqCst) {
            debug!(
                "Pool for '{}' destroyed; closing returned session #{}",
                self.target_group,
                session.id()
            );
            session.close();
            return;
        }

        session.mark_released();

        match self.host.reset_context(session.id()).await {
            Ok(()) => session.sanitize(),
            Err(e) => {
                self.sanitize_failures.fetch_add(1, Ordering::SeqCst);
                match self.cleanup_policy {
                    CleanupPolicy::BestEffort => {
                        warn!(
                            "Failed to sanitize session #{} in '{}': {}; returning it to service",
                            session.id(),
                            self.target_group,
                            e
                        );
                        session.sanitize();
                    }
                    CleanupPolicy::DiscardOnFailure => {
                        warn!(
                            "Discarding session #{} in '{}' after failed sanitization: {}",
                            session.id(),
                            self.target_group,
                            e
                        );
                        session.close();
                        let context_id = self.next_context_id.fetch_add(1, Ordering::SeqCst);
                        match self.host.open_context(context_id).await {
                            Ok(()) => {
                                session = Session::new(context_id, self.target_group.clone());
                            }
                            Err(e) => {
                                // No replacement and no permit returned; the
                                // pool keeps serving below capacity.
                                error!(
                                    "Failed to open replacement context in '{}': {}",
                                    self.target_group, e
                                );
                                return;
                            }
                        }
                    }
                }
            }
        }

        session.mark_idle();
        self.idle.lock().await.push(session);
        // The fair semaphore wakes the oldest waiter, which pops the
        // session just pushed (waiters only exist while the idle set is
        // empty). No extra round trip through the idle state.
        self.permits.add_permits(1);
    }

    /// Read-only metrics snapshot
    pub async fn metrics(&self) -> PoolMetrics {
        let idle = self.idle.lock().await.len();
        let total_allocations = self.total_allocations.load(Ordering::SeqCst);

        PoolMetrics {
            target_group: self.target_group.clone(),
            capacity: self.capacity,
            active: self.capacity.saturating_sub(idle),
            idle,
            total_allocations,
            average_reuse: if self.capacity == 0 {
                0.0
            } else {
                total_allocations as f64 / self.capacity as f64
            },
            peak_concurrent: self.peak_concurrent.load(Ordering::SeqCst),
            creation_time_ms: self.creation_time_ms,
            sanitize_failures: self.sanitize_failures.load(Ordering::SeqCst),
        }
    }

    /// Tear the pool down. Idempotent.
    ///
    /// Cancels the pool's token (the cooperative signal to in-flight
    /// checks), fails every queued allocation request with `PoolDestroyed`,
    /// closes idle sessions, then shuts the host down, force-closing any
    /// contexts still held by running checks.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            debug!("Pool for '{}' already destroyed", self.target_group);
            return Ok(());
        }

        info!("Destroying session pool for '{}'", self.target_group);
        self.cancel.cancel();

        let waiting = self.waiting.load(Ordering::SeqCst);
        if waiting > 0 {
            warn!(
                "Dropping {} queued allocation requests for '{}'",
                waiting, self.target_group
            );
        }
        self.permits.close();

        {
            let mut idle = self.idle.lock().await;
            for session in idle.iter_mut() {
                session.close();
            }
            idle.clear();
        }

        self.host.shutdown().await
    }

    fn destroyed_error(&self) -> EngineError {
        EngineError::PoolDestroyed {
            target_group: self.target_group.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cat_pool_config(capacity: usize) -> PoolConfig {
        PoolConfig {
            capacity,
            host: HostConfig {
                command: "cat".to_string(),
                args: vec![],
                headless: true,
                env: vec![],
            },
            cleanup_policy: CleanupPolicy::BestEffort,
        }
    }

    async fn cat_pool(capacity: usize) -> SessionPool {
        SessionPool::initialize("gateway-a", cat_pool_config(capacity))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialization() {
        let pool = cat_pool(2).await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.capacity, 2);
        assert_eq!(metrics.idle, 2);
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.total_allocations, 0);

        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocate_release_roundtrip() {
        let pool = cat_pool(2).await;

        let session = pool.allocate("authorize visa", None).await.unwrap();
        assert_eq!(session.usage_count(), 1);
        assert_eq!(session.current_check(), Some("authorize visa"));

        let metrics = pool.metrics().await;
        assert_eq!(metrics.active, 1);
        assert_eq!(metrics.idle, 1);
        assert_eq!(metrics.total_allocations, 1);

        let first_id = session.id();
        pool.release(session).await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.idle, 2);

        // The idle set is a stack, so the same session comes back
        let session = pool.allocate("authorize visa again", None).await.unwrap();
        assert_eq!(session.id(), first_id);
        assert_eq!(session.usage_count(), 2);
        pool.release(session).await;

        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_third_request_queues_until_release() {
        let pool = Arc::new(cat_pool(2).await);

        let s1 = pool.allocate("t1", None).await.unwrap();
        let _s2 = pool.allocate("t2", None).await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let waiter = tokio::spawn(async move {
            let session = waiter_pool.allocate("t3", None).await.unwrap();
            done_flag.store(true, Ordering::SeqCst);
            session
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!done.load(Ordering::SeqCst), "t3 resolved while saturated");

        pool.release(s1).await;
        let session = waiter.await.unwrap();
        assert!(done.load(Ordering::SeqCst));
        pool.release(session).await;

        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_fairness() {
        let pool = Arc::new(cat_pool(1).await);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let held = pool.allocate("holder", None).await.unwrap();

        let mut waiters = Vec::new();
        for label in ["first", "second", "third"] {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                let session = pool.allocate(label, None).await.unwrap();
                order.lock().push(label);
                pool.release(session).await;
            }));
            // Make enqueue order deterministic
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.release(held).await;
        for waiter in waiters {
            waiter.await.unwrap();
        }

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocation_timeout() {
        let pool = cat_pool(1).await;
        let _held = pool.allocate("holder", None).await.unwrap();

        let result = pool
            .allocate("too late", Some(Duration::from_millis(50)))
            .await;
        assert!(matches!(
            result,
            Err(EngineError::AllocationTimeout { waited_ms: 50, .. })
        ));

        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_rejects_queued_waiters() {
        let pool = Arc::new(cat_pool(1).await);
        let _held = pool.allocate("holder", None).await.unwrap();

        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move { waiter_pool.allocate("queued", None).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.destroy().await.unwrap();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(EngineError::PoolDestroyed { .. })));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let pool = cat_pool(2).await;
        pool.destroy().await.unwrap();
        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_allocate_after_destroy() {
        let pool = cat_pool(1).await;
        pool.destroy().await.unwrap();

        let result = pool.allocate("late", None).await;
        assert!(matches!(result, Err(EngineError::PoolDestroyed { .. })));
    }

    #[tokio::test]
    async fn test_sanitize_failure_best_effort() {
        let pool = cat_pool(1).await;
        let session = pool.allocate("dirty", None).await.unwrap();

        // Kill the host underneath the pool so the context reset fails
        pool.host.shutdown().await.unwrap();
        pool.release(session).await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.sanitize_failures, 1);
        assert_eq!(metrics.idle, 1);

        // The session is still usable by the next allocation
        let session = pool.allocate("next", None).await.unwrap();
        assert_eq!(session.usage_count(), 2);
        assert!(session.is_clean());
        pool.release(session).await;

        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_sanitize_failure_discard_policy() {
        let mut config = cat_pool_config(1);
        config.cleanup_policy = CleanupPolicy::DiscardOnFailure;
        let pool = SessionPool::initialize("gateway-a", config).await.unwrap();

        let session = pool.allocate("dirty", None).await.unwrap();

        // With the host gone, both the reset and the replacement open fail;
        // the dirty session is discarded and the pool shrinks below capacity
        pool.host.shutdown().await.unwrap();
        pool.release(session).await;

        let metrics = pool.metrics().await;
        assert_eq!(metrics.sanitize_failures, 1);
        assert_eq!(metrics.idle, 0);

        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_are_monotonic() {
        let pool = cat_pool(2).await;

        let s1 = pool.allocate("a", None).await.unwrap();
        let s2 = pool.allocate("b", None).await.unwrap();
        assert_eq!(pool.metrics().await.peak_concurrent, 2);

        pool.release(s1).await;
        pool.release(s2).await;

        let s3 = pool.allocate("c", None).await.unwrap();
        let metrics = pool.metrics().await;
        assert_eq!(metrics.peak_concurrent, 2);
        assert_eq!(metrics.total_allocations, 3);
        assert!((metrics.average_reuse - 1.5).abs() < f64::EPSILON);

        pool.release(s3).await;
        pool.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_cancels_pool_token() {
        let pool = cat_pool(1).await;
        let token = pool.cancellation_token();
        assert!(!token.is_cancelled());

        pool.destroy().await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_oversubscribe() {
        let pool = Arc::new(cat_pool(4).await);
        let peak_seen = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..16 {
            let pool = Arc::clone(&pool);
            let peak_seen = Arc::clone(&peak_seen);
            let active = Arc::clone(&active);
            handles.push(tokio::spawn(async move {
                let session = pool.allocate(&format!("check-{}", i), None).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                pool.release(session).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak_seen.load(Ordering::SeqCst) <= 4);
        assert_eq!(pool.metrics().await.total_allocations, 16);
        pool.destroy().await.unwrap();
    }
}
