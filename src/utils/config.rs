// src/utils/config.rs
//! Engine configuration
//!
//! Loaded once at startup from an optional `tollgate.toml` file plus
//! `TOLLGATE_*` environment overrides. The engine only ever consumes the
//! already-parsed values; nothing below this layer touches the environment.

use crate::runtime::pool::CleanupPolicy;
use crate::runtime::{HostConfig, PoolConfig};
use crate::utils::errors::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Master switch. When false the engine starts, logs, and exits.
    pub enabled: bool,

    /// Number of sessions opened in each target group's sandbox host
    pub sessions_per_host: usize,

    /// Run sandbox hosts headless (no attached UI)
    pub headless: bool,

    /// Target groups to run against; one pool is created per entry
    pub target_groups: Vec<String>,

    /// Executable used as the sandbox host process
    pub host_command: String,

    /// Arguments passed to the sandbox host
    pub host_args: Vec<String>,

    /// What to do when session sanitization fails on release
    pub cleanup_policy: CleanupPolicy,

    /// Optional cap on how long an allocation may wait for a session,
    /// in milliseconds. Absent means wait indefinitely.
    pub allocation_timeout_ms: Option<u64>,

    /// Interval between process-memory samples, in seconds
    pub sample_interval_secs: u64,

    /// Where the JSON run report is written
    pub report_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sessions_per_host: 4,
            headless: true,
            target_groups: vec![],
            host_command: "node".to_string(),
            host_args: vec!["-i".to_string()],
            cleanup_policy: CleanupPolicy::BestEffort,
            allocation_timeout_ms: None,
            sample_interval_secs: 5,
            report_path: "tollgate-report.json".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `tollgate.toml` (optional) and the
    /// `TOLLGATE_*` environment. `TOLLGATE_TARGET_GROUPS` accepts a
    /// comma-separated list.
    pub fn load() -> Result<Self> {
        let config = Config::builder()
            .add_source(File::with_name("tollgate").required(false))
            .add_source(
                Environment::with_prefix("TOLLGATE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("target_groups"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Sandbox host configuration derived from this engine config
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            command: self.host_command.clone(),
            args: self.host_args.clone(),
            headless: self.headless,
            env: vec![],
        }
    }

    /// Per-target-group pool configuration derived from this engine config
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.sessions_per_host,
            host: self.host_config(),
            cleanup_policy: self.cleanup_policy,
        }
    }

    /// Allocation timeout as a duration, if one is configured
    pub fn allocation_timeout(&self) -> Option<Duration> {
        self.allocation_timeout_ms.map(Duration::from_millis)
    }

    /// Memory sampling interval as a duration
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs.max(1))
    }
}
