// src/runtime/session.rs
//! Reusable sandboxed execution sessions
//!
//! A session is one execution context inside a target group's sandbox host.
//! It is owned by exactly one pool for its entire lifetime and never
//! migrates between pools. The pool applies every state transition; the
//! session itself is data plus the scratch state a check accumulates while
//! holding it (cookies, storage entries, open sub-contexts).

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// In the pool, ready to be allocated
    Idle,

    /// Held by exactly one check
    Allocated,

    /// Context closed; the session will never be allocated again
    Closed,
}

/// One reusable execution context owned by a session pool
#[derive(Debug)]
pub struct Session {
    /// Context id within the owning host, stable for the session's lifetime
    id: usize,

    /// Target group of the owning pool
    target_group: String,

    /// Current lifecycle state
    state: SessionState,

    /// Title of the check currently holding this session
    current_check: Option<String>,

    /// When the current (or last) allocation happened
    allocated_at: Option<DateTime<Utc>>,

    /// When the session was last released
    released_at: Option<DateTime<Utc>>,

    /// Total allocations over the session's lifetime; never resets
    usage_count: u64,

    /// Per-check cookie jar, cleared on sanitization
    cookies: HashMap<String, String>,

    /// Per-check storage entries, cleared on sanitization
    storage: HashMap<String, String>,

    /// Sub-contexts opened by the current check, closed on sanitization
    subcontexts: Vec<String>,
}

impl Session {
    /// Create an idle session for the given host context id
    pub(crate) fn new(id: usize, target_group: String) -> Self {
        Self {
            id,
            target_group,
            state: SessionState::Idle,
            current_check: None,
            allocated_at: None,
            released_at: None,
            usage_count: 0,
            cookies: HashMap::new(),
            storage: HashMap::new(),
            subcontexts: Vec::new(),
        }
    }

    /// Context id within the owning sandbox host
    pub fn id(&self) -> usize {
        self.id
    }

    /// Target group of the owning pool
    pub fn target_group(&self) -> &str {
        &self.target_group
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Title of the check currently holding this session, if any
    pub fn current_check(&self) -> Option<&str> {
        self.current_check.as_deref()
    }

    pub fn allocated_at(&self) -> Option<DateTime<Utc>> {
        self.allocated_at
    }

    pub fn released_at(&self) -> Option<DateTime<Utc>> {
        self.released_at
    }

    /// Lifetime allocation count
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    // --- state transitions, applied only by the owning pool ---

    pub(crate) fn mark_allocated(&mut self, check_title: &str) {
        self.state = SessionState::Allocated;
        self.current_check = Some(check_title.to_string());
        self.allocated_at = Some(Utc::now());
        self.usage_count += 1;
    }

    pub(crate) fn mark_released(&mut self) {
        self.released_at = Some(Utc::now());
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = SessionState::Idle;
        self.current_check = None;
    }

    pub(crate) fn close(&mut self) {
        self.state = SessionState::Closed;
        self.current_check = None;
    }

    /// Clear everything the previous check left behind
    pub(crate) fn sanitize(&mut self) {
        self.cookies.clear();
        self.storage.clear();
        self.subcontexts.clear();
    }

    // --- scratch state used by check bodies while holding the session ---

    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn put_storage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.storage.insert(key.into(), value.into());
    }

    pub fn storage(&self, key: &str) -> Option<&str> {
        self.storage.get(key).map(String::as_str)
    }

    pub fn open_subcontext(&mut self, name: impl Into<String>) {
        self.subcontexts.push(name.into());
    }

    pub fn subcontext_count(&self) -> usize {
        self.subcontexts.len()
    }

    /// True when no per-check artifacts remain
    pub fn is_clean(&self) -> bool {
        self.cookies.is_empty() && self.storage.is_empty() && self.subcontexts.is_empty()
    }
}
