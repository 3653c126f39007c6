//! Module lifecycle: state machine, cancellation, pause gate, counters.
//!
//! One [`ModuleController`] is shared (behind an `Arc`) by every scanner or
//! cleaner working on behalf of a module. Loops call [`ModuleController::checkpoint`]
//! between resource visits, never in the middle of mutating one resource.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{ErrorKind, ResidueError, Result};

const PAUSE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Uninitialized,
    Initialized,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Uninitialized => "uninitialized",
            ModuleState::Initialized => "initialized",
            ModuleState::Running => "running",
            ModuleState::Paused => "paused",
            ModuleState::Completed => "completed",
            ModuleState::Failed => "failed",
            ModuleState::Cancelled => "cancelled",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ModuleState::Running | ModuleState::Paused)
    }
}

// ========== Cancellation ==========

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    parent: Option<CancellationToken>,
}

/// Cooperative cancellation flag. A child observes its own flag and every
/// ancestor's; cancelling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut current = Some(self);
        while let Some(token) = current {
            if token.inner.cancelled.load(Ordering::SeqCst) {
                return true;
            }
            current = token.inner.parent.as_ref();
        }
        false
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ResidueError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ========== Pause gate ==========

#[derive(Debug, Clone, Default)]
pub struct PauseGate {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl PauseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        *lock(&self.inner.0) = true;
    }

    pub fn resume(&self) {
        *lock(&self.inner.0) = false;
        self.inner.1.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *lock(&self.inner.0)
    }

    /// Block while paused. Returns `Cancelled` as soon as `cancel` fires.
    pub fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let (flag, condvar) = &*self.inner;
        let mut paused = lock(flag);
        while *paused {
            cancel.check()?;
            let (guard, _) = condvar
                .wait_timeout(paused, PAUSE_POLL)
                .unwrap_or_else(|e| e.into_inner());
            paused = guard;
        }
        cancel.check()
    }
}

// ========== Statistics ==========

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Scanned,
    Found,
    Cleaned,
    Failed,
    Skipped,
    Denied,
}

#[derive(Debug, Default)]
struct Counters {
    scanned: AtomicU64,
    found: AtomicU64,
    cleaned: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    denied: AtomicU64,
    bytes_freed: AtomicU64,
}

impl Counters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Scanned => &self.scanned,
            Counter::Found => &self.found,
            Counter::Cleaned => &self.cleaned,
            Counter::Failed => &self.failed,
            Counter::Skipped => &self.skipped,
            Counter::Denied => &self.denied,
        }
    }

    fn reset(&self) {
        for slot in [
            &self.scanned,
            &self.found,
            &self.cleaned,
            &self.failed,
            &self.skipped,
            &self.denied,
            &self.bytes_freed,
        ] {
            slot.store(0, Ordering::SeqCst);
        }
    }
}

/// A per-resource error kept for the run report
#[derive(Debug, Clone, Serialize)]
pub struct RecordedError {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of a module's counters
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStats {
    pub module: String,
    pub state: ModuleState,
    pub items_scanned: u64,
    pub items_found: u64,
    pub items_cleaned: u64,
    pub items_failed: u64,
    pub items_skipped: u64,
    pub access_denied: u64,
    pub bytes_freed: u64,
    pub errors: usize,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl ModuleStats {
    /// Cleaned share of attempted removals, 1.0 when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.items_cleaned + self.items_failed;
        if attempted == 0 {
            return 1.0;
        }
        self.items_cleaned as f64 / attempted as f64
    }
}

pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

// ========== Controller ==========

pub type ProgressObserver = Arc<dyn Fn(f32, &str) + Send + Sync>;

#[derive(Debug)]
struct Lifecycle {
    state: ModuleState,
    started: Option<Instant>,
    finished: Option<Instant>,
}

pub struct ModuleController {
    name: String,
    lifecycle: Mutex<Lifecycle>,
    token: Mutex<CancellationToken>,
    gate: PauseGate,
    counters: Counters,
    errors: Mutex<Vec<RecordedError>>,
    observer: Mutex<Option<ProgressObserver>>,
}

impl ModuleController {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: Mutex::new(Lifecycle {
                state: ModuleState::Uninitialized,
                started: None,
                finished: None,
            }),
            token: Mutex::new(CancellationToken::new()),
            gate: PauseGate::new(),
            counters: Counters::default(),
            errors: Mutex::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_observer(&self, observer: ProgressObserver) {
        *lock(&self.observer) = Some(observer);
    }

    pub fn state(&self) -> ModuleState {
        lock(&self.lifecycle).state
    }

    /// Token for the current run. Executors derive per-task children from it.
    pub fn token(&self) -> CancellationToken {
        lock(&self.token).clone()
    }

    pub fn pause_gate(&self) -> PauseGate {
        self.gate.clone()
    }

    // ========== Transitions ==========

    pub fn initialize(&self) -> Result<()> {
        self.transition("initialize", |state| match state {
            ModuleState::Uninitialized | ModuleState::Initialized => Some(ModuleState::Initialized),
            _ => None,
        })
    }

    pub fn run(&self) -> Result<()> {
        self.transition("run", |state| match state {
            ModuleState::Initialized | ModuleState::Completed | ModuleState::Failed => {
                Some(ModuleState::Running)
            }
            _ => None,
        })?;
        self.counters.reset();
        lock(&self.errors).clear();
        let mut lifecycle = lock(&self.lifecycle);
        lifecycle.started = Some(Instant::now());
        lifecycle.finished = None;
        tracing::info!(module = %self.name, "module started");
        Ok(())
    }

    pub fn pause(&self) -> Result<()> {
        self.transition("pause", |state| match state {
            ModuleState::Running => Some(ModuleState::Paused),
            _ => None,
        })?;
        self.gate.pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.transition("resume", |state| match state {
            ModuleState::Paused => Some(ModuleState::Running),
            _ => None,
        })?;
        self.gate.resume();
        Ok(())
    }

    /// Idempotent and callable from any thread.
    pub fn cancel(&self) {
        self.token().cancel();
        {
            let mut lifecycle = lock(&self.lifecycle);
            if matches!(
                lifecycle.state,
                ModuleState::Initialized | ModuleState::Running | ModuleState::Paused
            ) {
                lifecycle.state = ModuleState::Cancelled;
                lifecycle.finished.get_or_insert_with(Instant::now);
            }
        }
        // Paused loops must wake up to see the flag.
        self.gate.resume();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token().is_cancelled()
    }

    /// Finish the run. A cancelled run stays cancelled.
    pub fn complete(&self) -> Result<()> {
        self.finish("complete", ModuleState::Completed)
    }

    pub fn fail(&self, reason: &str) -> Result<()> {
        tracing::warn!(module = %self.name, reason, "module failed");
        self.finish("fail", ModuleState::Failed)
    }

    /// Back to `Initialized` with a fresh cancellation token.
    pub fn reset(&self) -> Result<()> {
        self.transition("reset", |state| {
            if state.is_active() {
                None
            } else {
                Some(ModuleState::Initialized)
            }
        })?;
        *lock(&self.token) = CancellationToken::new();
        self.gate.resume();
        Ok(())
    }

    fn finish(&self, verb: &'static str, to: ModuleState) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        let current = lifecycle.state;
        match current {
            ModuleState::Cancelled => Ok(()),
            ModuleState::Running | ModuleState::Paused => {
                lifecycle.state = to;
                lifecycle.finished = Some(Instant::now());
                drop(lifecycle);
                self.gate.resume();
                tracing::info!(module = %self.name, state = to.as_str(), "module finished");
                Ok(())
            }
            from => Err(ResidueError::InvalidTransition {
                module: self.name.clone(),
                from: from.as_str(),
                to: verb,
            }),
        }
    }

    fn transition(
        &self,
        verb: &'static str,
        next: impl FnOnce(ModuleState) -> Option<ModuleState>,
    ) -> Result<()> {
        let mut lifecycle = lock(&self.lifecycle);
        match next(lifecycle.state) {
            Some(state) => {
                lifecycle.state = state;
                Ok(())
            }
            None => Err(ResidueError::InvalidTransition {
                module: self.name.clone(),
                from: lifecycle.state.as_str(),
                to: verb,
            }),
        }
    }

    // ========== Loop support ==========

    /// Called before each resource visit: fails fast on cancellation and
    /// blocks while paused.
    pub fn checkpoint(&self) -> Result<()> {
        let token = self.token();
        token.check()?;
        self.gate.wait(&token)
    }

    pub fn bump(&self, counter: Counter) {
        self.counters.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_freed(&self, bytes: u64) {
        self.counters.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn count(&self, counter: Counter) -> u64 {
        self.counters.slot(counter).load(Ordering::Relaxed)
    }

    pub fn record_error(&self, path: &str, err: &ResidueError) {
        tracing::debug!(module = %self.name, path, error = %err, "resource error");
        self.push_error(path, err.kind(), err.to_string());
    }

    pub fn record_panic(&self, path: &str, payload: &(dyn Any + Send)) {
        let message = format!("panic: {}", panic_message(payload));
        tracing::warn!(module = %self.name, path, %message, "resource visit panicked");
        self.push_error(path, ErrorKind::Io, message);
    }

    fn push_error(&self, path: &str, kind: ErrorKind, message: String) {
        lock(&self.errors).push(RecordedError {
            path: path.to_string(),
            kind,
            message,
            at: Utc::now(),
        });
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        lock(&self.errors).clone()
    }

    /// Forward progress to the observer. A panicking observer is logged, never propagated.
    pub fn report_progress(&self, fraction: f32, message: &str) {
        let Some(observer) = lock(&self.observer).clone() else {
            return;
        };
        let fraction = fraction.clamp(0.0, 1.0);
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer(fraction, message))) {
            tracing::warn!(
                module = %self.name,
                panic = %panic_message(payload.as_ref()),
                "progress observer panicked"
            );
        }
    }

    pub fn stats(&self) -> ModuleStats {
        let (state, duration) = {
            let lifecycle = lock(&self.lifecycle);
            let duration = match (lifecycle.started, lifecycle.finished) {
                (Some(start), Some(end)) => end.saturating_duration_since(start),
                (Some(start), None) => start.elapsed(),
                _ => Duration::ZERO,
            };
            (lifecycle.state, duration)
        };
        let load = |slot: &AtomicU64| slot.load(Ordering::SeqCst);
        ModuleStats {
            module: self.name.clone(),
            state,
            items_scanned: load(&self.counters.scanned),
            items_found: load(&self.counters.found),
            items_cleaned: load(&self.counters.cleaned),
            items_failed: load(&self.counters.failed),
            items_skipped: load(&self.counters.skipped),
            access_denied: load(&self.counters.denied),
            bytes_freed: load(&self.counters.bytes_freed),
            errors: lock(&self.errors).len(),
            duration,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
