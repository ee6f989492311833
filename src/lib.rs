// src/lib.rs
//! Tollgate Engine Library
//!
//! Concurrent conformance-check engine for upstream payment gateway APIs.
//! Checks run against expensive, reusable sandboxed sessions drawn from
//! per-target-group pools with FIFO admission control.
//!
//! # Architecture
//!
//! - **runtime**: sessions, sandbox hosts, session pools, the pool registry
//! - **orchestrator**: check definitions and the phased run state machine
//! - **observability**: metrics collection, run reports, tracing setup
//! - **utils**: configuration and error types

// Public module exports
pub mod observability;
pub mod orchestrator;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use observability::{init_tracing, MetricsCollector, RunReport};
pub use orchestrator::{CheckBody, CheckDefinition, CheckOrchestrator, CheckRegistry};
pub use runtime::{PoolConfig, PoolRegistry, Session, SessionPool};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
