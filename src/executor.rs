//! Parallel scan executor.
//!
//! Tasks are sorted by priority and pushed onto a fixed-size rayon pool. Each
//! task runs with a child of the caller's cancellation token and a deadline
//! that starts when the task begins running. Items flow back over a
//! crossbeam channel; [`TaskStream`] yields them as they arrive and also
//! enforces deadlines itself, so a task that stops checking its context is
//! reported `TimedOut` while the remaining tasks carry on.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::controller::{panic_message, CancellationToken, ModuleController};
use crate::error::{ErrorKind, ResidueError, Result};

/// Extra time granted past a deadline (or after cancellation) before the
/// collector stops waiting for a task.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(250);

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }
}

/// What a running job can see of its own task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: usize,
    pub token: CancellationToken,
    pub deadline: Option<Instant>,
    timeout: Option<Duration>,
}

impl TaskContext {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// `Cancelled` or `Timeout` once the task should stop.
    pub fn checkpoint(&self) -> Result<()> {
        self.token.check()?;
        if let (Some(deadline), Some(limit)) = (self.deadline, self.timeout) {
            if Instant::now() >= deadline {
                return Err(ResidueError::Timeout {
                    what: format!("task {}", self.id),
                    limit,
                });
            }
        }
        Ok(())
    }
}

type Job<T> = Box<dyn FnOnce(&TaskContext, &mut dyn FnMut(T)) -> Result<()> + Send>;

pub struct Task<T> {
    pub id: usize,
    pub label: String,
    pub priority: i32,
    pub timeout: Option<Duration>,
    job: Job<T>,
}

impl<T> Task<T> {
    pub fn new<F>(id: usize, label: impl Into<String>, job: F) -> Self
    where
        F: FnOnce(&TaskContext, &mut dyn FnMut(T)) -> Result<()> + Send + 'static,
    {
        Self {
            id,
            label: label.into(),
            priority: 0,
            timeout: None,
            job: Box::new(job),
        }
    }

    /// Higher priorities are dispatched first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

enum TaskEnd {
    Done,
    Error(ErrorKind, String),
    Panicked(String),
}

enum Message<T> {
    Started { id: usize, at: Instant },
    Item { id: usize, item: T },
    Finished { id: usize, end: TaskEnd },
}

pub struct ParallelExecutor {
    pool: Arc<ThreadPool>,
    workers: usize,
    grace: Duration,
    default_timeout: Option<Duration>,
}

impl ParallelExecutor {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(ResidueError::InvalidConfig {
                message: "worker count must be at least 1".to_string(),
            });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("residue-scan-{}", i))
            .build()
            .map_err(|e| ResidueError::InvalidConfig {
                message: format!("failed to build worker pool: {}", e),
            })?;
        Ok(Self {
            pool: Arc::new(pool),
            workers,
            grace: DEFAULT_GRACE,
            default_timeout: None,
        })
    }

    /// Pool sized to the machine's core count.
    pub fn with_default_size() -> Result<Self> {
        Self::new(num_cpus::get().max(1))
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Timeout applied to tasks that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Dispatch `tasks` and return a stream over their items.
    pub fn submit<T: Send + 'static>(
        &self,
        mut tasks: Vec<Task<T>>,
        token: CancellationToken,
    ) -> TaskStream<T> {
        let (tx, rx) = unbounded();
        tasks.sort_by_key(|t| std::cmp::Reverse(t.priority));

        let mut tracked = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let child = token.child();
            let timeout = task.timeout.or(self.default_timeout);
            tracked.insert(
                task.id,
                Tracked {
                    label: task.label.clone(),
                    status: TaskStatus::Pending,
                    timeout,
                    started: None,
                    token: child.clone(),
                    items: 0,
                    message: None,
                },
            );
            self.dispatch(task.id, task.job, child, timeout, tx.clone());
        }
        tracing::debug!(tasks = tracked.len(), workers = self.workers, "tasks dispatched");

        TaskStream {
            rx,
            remaining: tracked.len(),
            total: tracked.len(),
            tasks: tracked,
            token,
            grace: self.grace,
            cancel_seen: None,
            progress: None,
        }
    }

    fn dispatch<T: Send + 'static>(
        &self,
        id: usize,
        job: Job<T>,
        token: CancellationToken,
        timeout: Option<Duration>,
        tx: Sender<Message<T>>,
    ) {
        self.pool.spawn_fifo(move || {
            if token.is_cancelled() {
                let _ = tx.send(Message::Finished {
                    id,
                    end: TaskEnd::Error(ErrorKind::Cancelled, "cancelled before start".into()),
                });
                return;
            }
            let at = Instant::now();
            let _ = tx.send(Message::Started { id, at });

            let ctx = TaskContext {
                id,
                token,
                deadline: timeout.map(|t| at + t),
                timeout,
            };
            let item_tx = tx.clone();
            let mut emit = move |item: T| {
                let _ = item_tx.send(Message::Item { id, item });
            };
            let end = match panic::catch_unwind(AssertUnwindSafe(|| job(&ctx, &mut emit))) {
                Ok(Ok(())) => TaskEnd::Done,
                Ok(Err(e)) => TaskEnd::Error(e.kind(), e.to_string()),
                Err(payload) => TaskEnd::Panicked(panic_message(payload.as_ref())),
            };
            let _ = tx.send(Message::Finished { id, end });
        });
    }
}

struct Tracked {
    label: String,
    status: TaskStatus,
    timeout: Option<Duration>,
    started: Option<Instant>,
    token: CancellationToken,
    items: usize,
    message: Option<String>,
}

impl Tracked {
    fn expiry(&self, grace: Duration) -> Option<Instant> {
        match (self.status, self.started, self.timeout) {
            (TaskStatus::Running, Some(at), Some(limit)) => Some(at + limit + grace),
            _ => None,
        }
    }
}

/// Final state of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOutcome {
    pub id: usize,
    pub label: String,
    pub status: TaskStatus,
    pub items: usize,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl TaskReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn get(&self, id: usize) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

/// Items from every task, tagged with the task id. Order within one task is
/// preserved; order across tasks is whatever the workers produce.
pub struct TaskStream<T> {
    rx: Receiver<Message<T>>,
    tasks: HashMap<usize, Tracked>,
    token: CancellationToken,
    grace: Duration,
    cancel_seen: Option<Instant>,
    remaining: usize,
    total: usize,
    progress: Option<Arc<ModuleController>>,
}

impl<T> TaskStream<T> {
    /// Report per-task completion to the controller's progress observer.
    pub fn with_progress(mut self, controller: Arc<ModuleController>) -> Self {
        self.progress = Some(controller);
        self
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn report(&self) -> TaskReport {
        let mut outcomes: Vec<TaskOutcome> = self
            .tasks
            .iter()
            .map(|(id, t)| TaskOutcome {
                id: *id,
                label: t.label.clone(),
                status: t.status,
                items: t.items,
                message: t.message.clone(),
            })
            .collect();
        outcomes.sort_by_key(|o| o.id);
        TaskReport { outcomes }
    }

    fn finalize(&mut self, id: usize, status: TaskStatus, message: Option<String>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.status.is_final() {
            return;
        }
        task.status = status;
        task.message = message;
        if status == TaskStatus::TimedOut || status == TaskStatus::Cancelled {
            task.token.cancel();
        }
        match status {
            TaskStatus::Completed => tracing::debug!(task = %task.label, items = task.items, "task completed"),
            _ => tracing::info!(task = %task.label, status = ?status, "task ended early"),
        }
        let label = task.label.clone();
        self.remaining = self.remaining.saturating_sub(1);

        if let Some(controller) = &self.progress {
            let done = self.total - self.remaining;
            controller.report_progress(done as f32 / self.total.max(1) as f32, &label);
        }
    }

    fn next_wakeup(&mut self, now: Instant) -> Instant {
        let mut wake = now + IDLE_POLL;
        if self.token.is_cancelled() {
            let seen = *self.cancel_seen.get_or_insert(now);
            wake = wake.min(seen + self.grace);
        }
        for task in self.tasks.values() {
            if let Some(expiry) = task.expiry(self.grace) {
                wake = wake.min(expiry);
            }
        }
        wake.max(now)
    }

    fn enforce_limits(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.expiry(self.grace).is_some_and(|e| now >= e))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            let limit = self.tasks[&id].timeout.unwrap_or_default();
            self.finalize(id, TaskStatus::TimedOut, Some(format!("exceeded {:?}", limit)));
        }

        if let Some(seen) = self.cancel_seen {
            if now >= seen + self.grace {
                let open: Vec<usize> = self
                    .tasks
                    .iter()
                    .filter(|(_, t)| !t.status.is_final())
                    .map(|(id, _)| *id)
                    .collect();
                for id in open {
                    self.finalize(id, TaskStatus::Cancelled, Some("cancelled".to_string()));
                }
            }
        }
    }

    fn on_finished(&mut self, id: usize, end: TaskEnd) {
        let (status, message) = match end {
            TaskEnd::Done => (TaskStatus::Completed, None),
            TaskEnd::Error(ErrorKind::Cancelled, msg) => (TaskStatus::Cancelled, Some(msg)),
            TaskEnd::Error(ErrorKind::Timeout, msg) => (TaskStatus::TimedOut, Some(msg)),
            TaskEnd::Error(_, msg) => (TaskStatus::Failed, Some(msg)),
            TaskEnd::Panicked(msg) => (TaskStatus::Failed, Some(format!("panicked: {}", msg))),
        };
        self.finalize(id, status, message);
    }
}

impl<T> Iterator for TaskStream<T> {
    type Item = (usize, T);

    fn next(&mut self) -> Option<(usize, T)> {
        while self.remaining > 0 {
            let now = Instant::now();
            let wake = self.next_wakeup(now);

            match self.rx.recv_timeout(wake.saturating_duration_since(now)) {
                Ok(Message::Started { id, at }) => {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        if task.status == TaskStatus::Pending {
                            task.status = TaskStatus::Running;
                            task.started = Some(at);
                        }
                    }
                }
                Ok(Message::Item { id, item }) => {
                    if let Some(task) = self.tasks.get_mut(&id) {
                        // Items from a task already given up on are dropped.
                        if !task.status.is_final() {
                            task.items += 1;
                            return Some((id, item));
                        }
                    }
                }
                Ok(Message::Finished { id, end }) => self.on_finished(id, end),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let open: Vec<usize> = self
                        .tasks
                        .iter()
                        .filter(|(_, t)| !t.status.is_final())
                        .map(|(id, _)| *id)
                        .collect();
                    for id in open {
                        self.finalize(id, TaskStatus::Failed, Some("worker vanished".into()));
                    }
                }
            }
            self.enforce_limits(Instant::now());
        }
        None
    }
}
