// crates/core/src/engine/mod.rs
//! Priority-ordered worker pool that every job builds on.
//!
//! Provides:
//! - `TaskEngine`: fixed pool of worker threads draining a priority queue
//! - `TaskHandle` / `Settled`: result handles and prerequisite signals
//! - `TaskStats`: aggregate counters snapshot
//!
//! Ordering: priority descending, then enqueue order. Dependent tasks are
//! checked for readiness when a worker looks for its next task, never at
//! enqueue time, so a dependent task may sit in the queue while lower
//! priority ready tasks run past it.

pub mod handle;
pub mod types;

use std::any::Any;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use handle::ResultSlot;

pub use handle::{Settled, TaskHandle};
pub use types::{Priority, ProgressHandle, ProgressSink, TaskError, TaskStats};

/// How long an idle worker waits before re-checking queued tasks that were
/// not ready. Prerequisites may settle on another engine, which cannot wake
/// this engine's workers directly.
const READY_RECHECK: Duration = Duration::from_millis(20);

/// Submission options. `Default` gives a normal-priority, independent,
/// non-cancellable task.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub priority: Priority,
    pub cancel: Option<CancellationToken>,
    pub prerequisites: Vec<Settled>,
}

impl TaskOptions {
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_prerequisites(mut self, prerequisites: Vec<Settled>) -> Self {
        self.prerequisites = prerequisites;
        self
    }
}

/// Fixed-size worker pool with priority ordering, cooperative cancellation
/// and dependency gating.
pub struct TaskEngine {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

struct Shared {
    queue: Mutex<QueueState>,
    work_cv: Condvar,
    idle_cv: Condvar,
    stats: Mutex<StatsAccumulator>,
}

#[derive(Default)]
struct QueueState {
    tasks: BTreeMap<QueueKey, Task>,
    next_seq: u64,
    active: usize,
    stopping: bool,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
}

struct Task {
    cancel: Option<CancellationToken>,
    prerequisites: Vec<Settled>,
    run: Box<dyn FnOnce(Dispatch) -> Outcome + Send>,
}

enum Dispatch {
    Run,
    Skip,
}

enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Default)]
struct StatsAccumulator {
    total_enqueued: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    total_duration_ms: f64,
}

impl Task {
    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Cancelled tasks count as ready so they can be skipped promptly.
    fn is_ready(&self) -> bool {
        self.is_cancelled() || self.prerequisites.iter().all(Settled::is_settled)
    }
}

impl QueueState {
    fn take_ready(&mut self) -> Option<Task> {
        let key = self
            .tasks
            .iter()
            .find(|(_, task)| task.is_ready())
            .map(|(key, _)| QueueKey {
                priority: key.priority,
                seq: key.seq,
            })?;
        self.tasks.remove(&key)
    }

    fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.active == 0
    }
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, StatsAccumulator> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskEngine {
    /// Create an engine with `workers` threads. Zero means "use the host's
    /// available parallelism".
    ///
    /// Workers that fail to spawn are logged and the engine runs with the
    /// rest; `EngineError::NoWorkers` when none could be spawned.
    pub fn new(workers: usize) -> Result<Self, EngineError> {
        let size = if workers == 0 {
            default_workers()
        } else {
            workers
        };
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            work_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            stats: Mutex::new(StatsAccumulator::default()),
        });

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let shared = Arc::clone(&shared);
            match thread::Builder::new()
                .name(format!("vmbackup-worker-{i}"))
                .spawn(move || worker_loop(shared))
            {
                Ok(h) => handles.push(h),
                Err(e) => tracing::error!(worker = i, error = %e, "Failed to spawn engine worker"),
            }
        }
        if handles.is_empty() {
            return Err(EngineError::NoWorkers { requested: size });
        }
        tracing::debug!(workers = handles.len(), "Task engine started");

        Ok(Self {
            shared,
            size: handles.len(),
            workers: Mutex::new(handles),
        })
    }

    /// Number of worker threads actually running.
    pub fn worker_count(&self) -> usize {
        self.size
    }

    /// Submit normal-priority work.
    pub fn submit<T, E, F>(&self, work: F) -> Result<TaskHandle<T, E>, EngineError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit_with(TaskOptions::default(), work)
    }

    pub fn submit_with_priority<T, E, F>(
        &self,
        priority: Priority,
        work: F,
    ) -> Result<TaskHandle<T, E>, EngineError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit_with(TaskOptions::priority(priority), work)
    }

    /// Submit work that reports its own progress through a `ProgressSink`.
    pub fn submit_with_progress<T, E, F>(
        &self,
        work: F,
    ) -> Result<(TaskHandle<T, E>, ProgressHandle), EngineError>
    where
        F: FnOnce(&ProgressSink) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let (sink, progress) = types::progress_pair();
        let handle = self.submit(move || work(&sink))?;
        Ok((handle, progress))
    }

    /// Submit work paired with a fresh cancellation token. If the token is
    /// cancelled before a worker picks the task up, the work never runs and
    /// the handle resolves to `TaskError::Cancelled`.
    pub fn submit_cancellable<T, E, F>(
        &self,
        work: F,
    ) -> Result<(TaskHandle<T, E>, CancellationToken), EngineError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = self.submit_with(TaskOptions::default().with_cancel(token.clone()), work)?;
        Ok((handle, token))
    }

    /// Submit work that becomes eligible only after every prerequisite has
    /// settled, successfully or not.
    pub fn submit_dependent<T, E, F>(
        &self,
        prerequisites: Vec<Settled>,
        work: F,
    ) -> Result<TaskHandle<T, E>, EngineError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.submit_with(TaskOptions::default().with_prerequisites(prerequisites), work)
    }

    /// General submission entry point.
    pub fn submit_with<T, E, F>(
        &self,
        options: TaskOptions,
        work: F,
    ) -> Result<TaskHandle<T, E>, EngineError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let slot = ResultSlot::new();
        let task_slot = Arc::clone(&slot);
        let run = Box::new(move |dispatch: Dispatch| match dispatch {
            Dispatch::Skip => {
                task_slot.fill(Err(TaskError::Cancelled));
                Outcome::Cancelled
            }
            Dispatch::Run => match catch_unwind(AssertUnwindSafe(work)) {
                Ok(Ok(value)) => {
                    task_slot.fill(Ok(value));
                    Outcome::Completed
                }
                Ok(Err(e)) => {
                    task_slot.fill(Err(TaskError::Failed(e)));
                    Outcome::Failed
                }
                Err(payload) => {
                    let msg = panic_message(payload.as_ref());
                    tracing::error!(panic = %msg, "Task panicked; worker continues");
                    task_slot.fill(Err(TaskError::Panicked(msg)));
                    Outcome::Failed
                }
            },
        });

        let task = Task {
            cancel: options.cancel,
            prerequisites: options.prerequisites,
            run,
        };
        self.enqueue(options.priority, task)?;
        Ok(TaskHandle::new(slot))
    }

    fn enqueue(&self, priority: Priority, task: Task) -> Result<(), EngineError> {
        {
            let mut q = self.shared.queue();
            if q.stopping {
                return Err(EngineError::ShuttingDown);
            }
            let seq = q.next_seq;
            q.next_seq += 1;
            q.tasks.insert(
                QueueKey {
                    priority: Reverse(priority),
                    seq,
                },
                task,
            );
            self.shared.stats().total_enqueued += 1;
        }
        self.shared.work_cv.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and no worker is mid-task.
    ///
    /// Dependent tasks whose prerequisites never settle keep the engine
    /// busy; callers must not wait on such a configuration.
    pub fn await_idle(&self) {
        let mut q = self.shared.queue();
        while !q.is_idle() {
            q = self
                .shared
                .idle_cv
                .wait(q)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn stats(&self) -> TaskStats {
        let depth = self.shared.queue().tasks.len();
        let s = self.shared.stats();
        let timed = s.completed + s.failed;
        TaskStats {
            total_enqueued: s.total_enqueued,
            completed: s.completed,
            failed: s.failed,
            cancelled: s.cancelled,
            average_duration_ms: if timed == 0 {
                0.0
            } else {
                s.total_duration_ms / timed as f64
            },
            current_queue_depth: depth,
        }
    }

    /// Wake idle workers so they re-check queued tasks gated on signals
    /// settled outside this engine.
    pub(crate) fn wake(&self) {
        self.shared.work_cv.notify_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.queue().stopping
    }

    /// Stop accepting work, let queued and in-flight tasks finish, then join
    /// the workers. Idempotent. A worker calling this on its own engine does
    /// not join itself.
    pub fn shutdown(&self) {
        {
            let mut q = self.shared.queue();
            if !q.stopping {
                q.stopping = true;
                tracing::debug!(queued = q.tasks.len(), "Task engine shutting down");
            }
        }
        self.shared.work_cv.notify_all();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            workers.drain(..).collect()
        };
        let me = thread::current().id();
        for h in handles {
            if h.thread().id() == me {
                continue;
            }
            if h.join().is_err() {
                tracing::error!("Engine worker exited by panic");
            }
        }
    }
}

impl Drop for TaskEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEngine")
            .field("workers", &self.size)
            .field("stats", &self.stats())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let task = {
            let mut q = shared.queue();
            loop {
                if let Some(task) = q.take_ready() {
                    q.active += 1;
                    break task;
                }
                if q.stopping && q.tasks.is_empty() {
                    return;
                }
                q = if q.tasks.is_empty() {
                    shared.work_cv.wait(q).unwrap_or_else(PoisonError::into_inner)
                } else {
                    shared
                        .work_cv
                        .wait_timeout(q, READY_RECHECK)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                };
            }
        };

        let dispatch = if task.is_cancelled() {
            Dispatch::Skip
        } else {
            Dispatch::Run
        };
        let started = Instant::now();
        let outcome = (task.run)(dispatch);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        {
            let mut s = shared.stats();
            match outcome {
                Outcome::Completed => {
                    s.completed += 1;
                    s.total_duration_ms += elapsed_ms;
                }
                Outcome::Failed => {
                    s.failed += 1;
                    s.total_duration_ms += elapsed_ms;
                }
                Outcome::Cancelled => s.cancelled += 1,
            }
        }

        {
            let mut q = shared.queue();
            q.active -= 1;
            if q.is_idle() {
                shared.idle_cv.notify_all();
            }
        }
        // A settled task may unblock dependents waiting in the queue.
        shared.work_cv.notify_all();
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
