//! Per-run state: the session handle, its memo, and its budget.
//!
//! A [`RunSession`] is the explicit handle for one root pipeline
//! invocation. It is created by [`RunSession::begin`] (persisted under a
//! location) or [`RunSession::ephemeral`] (in-memory only) and passed
//! explicitly into `transform` calls; nested sub-pipeline calls receive it
//! through their [`StepContext`]. Everything the run accumulates lives
//! here: the in-memory result memo, the ordered log of artifact locations
//! referenced this run, invocation counters for non-deterministic steps,
//! the cooperative abort flag, and the spend budget.
//!
//! Dropping the last session handle discards the in-memory state; the
//! artifacts it wrote remain on disk for future runs to rediscover.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AbortError;

/// Configuration for a run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Whether step results are persisted to disk.
    pub save_result: bool,
    /// Whether the validated input is persisted alongside each result.
    pub save_input: bool,
    /// When set, only the named steps may reuse persisted results; other
    /// steps always recompute. `None` enables disk reuse for every step.
    pub enable_cache_for: Option<Vec<String>>,
    /// Optional spend limit enforced by [`RunSession::charge`].
    pub budget_limit: Option<f64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            save_result: true,
            save_input: false,
            enable_cache_for: None,
            budget_limit: None,
        }
    }
}

/// Tracks spend against an optional limit.
///
/// Replaces the source system's module-level running total: the budget is
/// owned by the run state and travels with the session, so parallel runs
/// and tests cannot leak spend into each other.
#[derive(Debug)]
pub struct Budget {
    limit: Option<f64>,
    spent: Mutex<f64>,
}

impl Budget {
    fn new(limit: Option<f64>) -> Self {
        Self {
            limit,
            spent: Mutex::new(0.0),
        }
    }

    /// Records spend and fails once the limit is crossed.
    ///
    /// # Errors
    ///
    /// Returns an [`AbortError`] when the running total exceeds the limit.
    pub fn charge(&self, amount: f64) -> Result<(), AbortError> {
        let mut spent = self.spent.lock();
        *spent += amount;
        match self.limit {
            Some(limit) if *spent > limit => Err(AbortError::budget_exceeded(*spent, limit)),
            _ => Ok(()),
        }
    }

    /// Returns the running total.
    #[must_use]
    pub fn spent(&self) -> f64 {
        *self.spent.lock()
    }

    /// Returns the configured limit, if any.
    #[must_use]
    pub fn limit(&self) -> Option<f64> {
        self.limit
    }
}

#[derive(Debug)]
struct RunState {
    id: Uuid,
    started_at: DateTime<Utc>,
    root: Option<PathBuf>,
    options: RunOptions,
    results: DashMap<String, Value>,
    log: Mutex<Vec<PathBuf>>,
    invocations: DashMap<String, u64>,
    aborted: AtomicBool,
    abort_reason: Mutex<Option<String>>,
    budget: Budget,
}

/// Handle to the state of one root pipeline invocation.
///
/// Cheap to clone; all clones share the same state. Re-entrant calls
/// holding the same session share one cache, so a sub-pipeline invoked
/// twice with identical input inside one parent run computes once. A
/// fresh session (or a later process run) starts empty and rediscovers
/// cache hits purely from disk.
#[derive(Debug, Clone)]
pub struct RunSession {
    state: Arc<RunState>,
}

impl RunSession {
    /// Begins a persisted run rooted at `location`.
    #[must_use]
    pub fn begin(location: impl Into<PathBuf>) -> Self {
        Self::begin_with(location, RunOptions::default())
    }

    /// Begins a persisted run with explicit options.
    #[must_use]
    pub fn begin_with(location: impl Into<PathBuf>, options: RunOptions) -> Self {
        Self::build(Some(location.into()), options)
    }

    /// Begins an in-memory run with no persistence location.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::build(None, RunOptions::default())
    }

    fn build(root: Option<PathBuf>, options: RunOptions) -> Self {
        let budget = Budget::new(options.budget_limit);
        Self {
            state: Arc::new(RunState {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
                root,
                options,
                results: DashMap::new(),
                log: Mutex::new(Vec::new()),
                invocations: DashMap::new(),
                aborted: AtomicBool::new(false),
                abort_reason: Mutex::new(None),
                budget,
            }),
        }
    }

    /// Returns the run identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// Returns when the run began.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.state.started_at
    }

    /// Returns the root persistence location, if any.
    #[must_use]
    pub fn location(&self) -> Option<&Path> {
        self.state.root.as_deref()
    }

    /// Returns the run options.
    #[must_use]
    pub fn options(&self) -> &RunOptions {
        &self.state.options
    }

    /// Returns the step context rooted at this session's location.
    #[must_use]
    pub fn context(&self) -> StepContext {
        StepContext {
            session: self.clone(),
            location: self.state.root.clone(),
        }
    }

    /// Returns the spend budget.
    #[must_use]
    pub fn budget(&self) -> &Budget {
        &self.state.budget
    }

    /// Records spend against the budget; crossing the limit aborts the
    /// run so the next step fails fast.
    ///
    /// # Errors
    ///
    /// Returns the [`AbortError`] raised by the budget.
    pub fn charge(&self, amount: f64) -> Result<(), AbortError> {
        match self.state.budget.charge(amount) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort(err.reason.clone());
                Err(err)
            }
        }
    }

    /// Sets the cooperative abort flag. In-flight steps are not
    /// interrupted; the next step entry fails fast.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut stored = self.state.abort_reason.lock();
        if stored.is_none() {
            *stored = Some(reason.into());
        }
        self.state.aborted.store(true, Ordering::SeqCst);
    }

    /// Returns true once the run has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Fails fast if the run has been aborted.
    ///
    /// # Errors
    ///
    /// Returns the stored [`AbortError`].
    pub fn ensure_active(&self) -> Result<(), AbortError> {
        if self.is_aborted() {
            let reason = self
                .state
                .abort_reason
                .lock()
                .clone()
                .unwrap_or_else(|| "aborted".to_string());
            return Err(AbortError::new(reason));
        }
        Ok(())
    }

    /// Returns true if the named step may reuse persisted results.
    #[must_use]
    pub fn cache_enabled_for(&self, step: &str) -> bool {
        self.state
            .options
            .enable_cache_for
            .as_ref()
            .map_or(true, |names| names.iter().any(|name| name == step))
    }

    /// Looks up a memoized result by its full id.
    #[must_use]
    pub fn cached_result(&self, full_id: &str) -> Option<Value> {
        self.state.results.get(full_id).map(|entry| entry.clone())
    }

    /// Memoizes a result under its full id.
    pub fn record_result(&self, full_id: impl Into<String>, result: Value) {
        self.state.results.insert(full_id.into(), result);
    }

    /// Appends an artifact location to the run log.
    ///
    /// The log records every artifact referenced (written or reused) this
    /// run; cleanup keeps referenced locations and deletes stale ones.
    pub fn record_reference(&self, path: impl Into<PathBuf>) {
        self.state.log.lock().push(path.into());
    }

    /// Returns the ordered run log.
    #[must_use]
    pub fn log(&self) -> Vec<PathBuf> {
        self.state.log.lock().clone()
    }

    /// Returns the next invocation number for an element id, starting
    /// at 1. Used to salt the ids of non-deterministic steps so each call
    /// within one run gets a fresh id, while a later run (whose counter
    /// restarts at the same values) still resumes from disk.
    #[must_use]
    pub fn next_invocation(&self, key: &str) -> u64 {
        let mut entry = self.state.invocations.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// The context a step executes in: the shared session plus this nesting
/// level's persistence location.
///
/// The engine hands each recomputed step a child context rooted at the
/// step's own element id, so a step can act as a sub-pipeline root and its
/// nested artifacts land under `<location>/<element id>/`.
#[derive(Debug, Clone)]
pub struct StepContext {
    session: RunSession,
    location: Option<PathBuf>,
}

impl StepContext {
    /// Returns the shared run session.
    #[must_use]
    pub fn session(&self) -> &RunSession {
        &self.session
    }

    /// Returns this level's persistence location, if persisting.
    #[must_use]
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Returns the context for a nested level under an element id.
    #[must_use]
    pub fn child(&self, element_id: &str) -> Self {
        Self {
            session: self.session.clone(),
            location: self
                .location
                .as_ref()
                .map(|location| location.join(element_id)),
        }
    }

    /// Returns the location-qualified form of an element id, used as the
    /// memo key so equal ids at different nesting levels do not collide.
    #[must_use]
    pub fn qualified_id(&self, element_id: &str) -> String {
        self.location.as_ref().map_or_else(
            || element_id.to_string(),
            |location| location.join(element_id).to_string_lossy().into_owned(),
        )
    }
}
