// src/utils/errors.rs
//! Engine error types
//!
//! One error enum for the whole engine. Pool initialization failures are
//! fatal and propagate; everything else is recovered close to where it
//! happens (see the pool and orchestrator modules).

use thiserror::Error;

/// Errors produced by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// The sandbox host process for a target group could not be started.
    /// Fatal for that pool; the run aborts.
    #[error("failed to spawn sandbox host: {0}")]
    HostSpawnFailed(String),

    /// A session context could not be opened during pool initialization.
    /// Not retried; the pool is unusable and must be destroyed.
    #[error("failed to open session context: {0}")]
    SessionCreationFailed(String),

    /// Allocation or release was routed to a target group that was never
    /// initialized.
    #[error("no session pool initialized for target group '{0}'")]
    UnknownTargetGroup(String),

    /// The pool was destroyed while the caller was queued for a session,
    /// or before it called allocate.
    #[error("session pool for target group '{target_group}' was destroyed")]
    PoolDestroyed { target_group: String },

    /// An explicit allocation timeout elapsed before a session became
    /// available.
    #[error("timed out after {waited_ms}ms waiting for a session in target group '{target_group}'")]
    AllocationTimeout { target_group: String, waited_ms: u64 },

    /// A registered check definition is malformed (e.g. duplicate setup
    /// order within a target group).
    #[error("invalid check definition: {0}")]
    InvalidCheckDefinition(String),

    /// Configuration could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The run report could not be serialized or written.
    #[error("report export failed: {0}")]
    ExportFailed(String),

    /// Catch-all for host I/O and other runtime failures.
    #[error("runtime error: {0}")]
    RuntimeError(String),
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;
