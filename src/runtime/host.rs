// src/runtime/host.rs
//! Sandbox host processes
//!
//! Each target group's pool owns exactly one host process that contains the
//! group's session contexts. The engine drives it over a line-oriented
//! command protocol on stdin:
//!
//! - `OPEN <ctx>`: create a session context
//! - `RESET <ctx>`: drop the context's accumulated state
//! - `CLOSE <ctx>`: tear the context down
//!
//! Shutdown is graceful-then-forced: SIGTERM, a bounded wait, then SIGKILL
//! for anything still alive.

use crate::utils::errors::{EngineError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Configuration for spawning a sandbox host
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Executable name, resolved through PATH
    pub command: String,

    /// Arguments passed to the executable
    pub args: Vec<String>,

    /// Run without an attached UI; exported as TOLLGATE_HEADLESS
    pub headless: bool,

    /// Extra environment variables
    pub env: Vec<(String, String)>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command: "node".to_string(),
            args: vec!["-i".to_string()],
            headless: true,
            env: vec![],
        }
    }
}

/// One sandbox host process owned by a session pool
pub struct SandboxHost {
    /// Target group this host serves
    target_group: String,

    /// The spawned process
    child: Mutex<Option<Child>>,

    /// Stdin handle for the command protocol
    stdin: Mutex<Option<ChildStdin>>,

    /// Process id captured at spawn time
    pid: u32,

    /// When the host was spawned
    started_at: Instant,
}

impl SandboxHost {
    /// Resolve the executable and spawn the host process.
    ///
    /// Failure here is fatal for the owning pool and propagates.
    pub async fn spawn(target_group: &str, config: HostConfig) -> Result<Self> {
        let executable = resolve_executable(&config.command)?;

        debug!(
            "Spawning sandbox host for '{}': {:?} {:?}",
            target_group, executable, config.args
        );

        let mut command = Command::new(&executable);
        command
            .args(&config.args)
            .env(
                "TOLLGATE_HEADLESS",
                if config.headless { "1" } else { "0" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::HostSpawnFailed(format!("{:?}: {}", executable, e)))?;

        let pid = child
            .id()
            .ok_or_else(|| EngineError::HostSpawnFailed("process exited at spawn".to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::HostSpawnFailed("failed to capture stdin".to_string()))?;

        info!("Sandbox host for '{}' running with PID {}", target_group, pid);

        Ok(Self {
            target_group: target_group.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            pid,
            started_at: Instant::now(),
        })
    }

    /// Create a session context inside the host
    pub async fn open_context(&self, context_id: usize) -> Result<()> {
        self.send(&format!("OPEN {}", context_id))
            .await
            .map_err(|e| EngineError::SessionCreationFailed(e.to_string()))
    }

    /// Drop all state accumulated by a session context
    pub async fn reset_context(&self, context_id: usize) -> Result<()> {
        self.send(&format!("RESET {}", context_id)).await
    }

    /// Tear a session context down
    pub async fn close_context(&self, context_id: usize) -> Result<()> {
        self.send(&format!("CLOSE {}", context_id)).await
    }

    /// Write one protocol line to the host's stdin
    async fn send(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            EngineError::RuntimeError(format!(
                "sandbox host for '{}' has no stdin (already shut down?)",
                self.target_group
            ))
        })?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::RuntimeError(format!("host write failed: {}", e)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| EngineError::RuntimeError(format!("host write failed: {}", e)))?;
        stdin
            .flush()
            .await
            .map_err(|e| EngineError::RuntimeError(format!("host flush failed: {}", e)))?;

        Ok(())
    }

    /// Check whether the host process is still alive
    pub fn is_running(&self) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(self.pid as i32), None).is_ok()
    }

    /// Process id of the host
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// How long the host has been up
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Shut the host down: SIGTERM, bounded wait, SIGKILL if still alive.
    ///
    /// In-flight contexts die with the process. Idempotent; a second call
    /// is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Closing stdin first lets well-behaved hosts exit on their own
        *self.stdin.lock().await = None;

        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            debug!("Sandbox host for '{}' already shut down", self.target_group);
            return Ok(());
        };

        debug!(
            "Shutting down sandbox host for '{}' (PID {})",
            self.target_group, self.pid
        );

        let pid = Pid::from_raw(self.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!("SIGTERM to PID {} failed ({}), process likely gone", self.pid, e);
        }

        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                debug!(
                    "Sandbox host for '{}' exited with status {}",
                    self.target_group, status
                );
                Ok(())
            }
            Ok(Err(e)) => Err(EngineError::RuntimeError(format!(
                "error waiting for sandbox host: {}",
                e
            ))),
            Err(_) => {
                warn!(
                    "Sandbox host for '{}' did not exit in time, sending SIGKILL",
                    self.target_group
                );
                if let Err(e) = child.kill().await {
                    return Err(EngineError::RuntimeError(format!(
                        "failed to kill sandbox host: {}",
                        e
                    )));
                }
                Ok(())
            }
        }
    }
}

impl Drop for SandboxHost {
    fn drop(&mut self) {
        // Best-effort: if shutdown was never called, make sure the process
        // does not outlive the pool. start_kill is synchronous and safe here.
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Find the host executable in PATH
fn resolve_executable(command: &str) -> Result<PathBuf> {
    which::which(command).map_err(|e| {
        EngineError::HostSpawnFailed(format!("executable '{}' not found in PATH: {}", command, e))
    })
}
