// crates/core/src/job/mod.rs
//! Long-running backup, verify and restore jobs.
//!
//! Provides:
//! - `Job<W>`: the uniform control surface (start/pause/resume/cancel)
//! - `JobWork`: what a concrete job kind does once dispatched
//! - `JobContext`: worker-side handle for progress, status and safe points
//! - `BackupJob`, `VerifyJob`, `RestoreJob`: the three concrete kinds

pub mod backup;
pub mod config;
pub mod copy;
mod fanout;
pub mod restore;
mod state;
pub mod types;
pub mod verify;

use std::convert::Infallible;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::engine::{Priority, Settled, TaskEngine, TaskOptions};
use crate::error::JobError;
use state::{Begin, JobCore};

pub use backup::{BackupJob, BackupWork};
pub use config::{BackupConfig, RestoreConfig, VerifyConfig};
pub use restore::{RestoreJob, RestoreWork};
pub use types::{JobId, JobKind, JobSnapshot, JobStatus, ProgressCallback, StatusCallback};
pub use verify::{VerifyJob, VerifyWork};

/// Where a job's tasks run.
enum EngineSource {
    /// Caller-owned; left running when the job settles.
    Shared,
    /// Spawned at dispatch with this many workers and shut down once the
    /// job settles.
    Dedicated { workers: usize },
}

/// The kind-specific half of a job.
///
/// `execute` runs on one of the job's engine workers and may fan out further
/// tasks on `ctx.engine()`. It must call `ctx.checkpoint()` between units of
/// work so pause and cancel are observed.
pub trait JobWork: Send + Sync + 'static {
    const KIND: JobKind;

    /// Synchronous configuration check performed by `start()`.
    fn validate(&self) -> Result<(), JobError>;

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Hooks invoked after the matching control transition succeeded.
    fn on_pause(&self) {}
    fn on_resume(&self) {}
    fn on_cancel(&self) {}
}

/// Worker-side view of a running job. Cheap to clone into sub-tasks.
#[derive(Clone)]
pub struct JobContext {
    core: Arc<JobCore>,
    engine: Arc<TaskEngine>,
}

impl JobContext {
    pub fn job_id(&self) -> JobId {
        self.core.id()
    }

    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Park while paused; `Err(JobError::Cancelled)` once cancelled.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        self.core.checkpoint()
    }

    /// Last safe point before the work makes its result durable. After
    /// `Ok`, `cancel()` and `pause()` are refused and the job settles as
    /// completed or failed.
    pub fn commit(&self) -> Result<(), JobError> {
        self.core.commit()
    }

    pub fn report_progress(&self, percent: u8) {
        self.core.report_progress(percent);
    }

    pub fn report_status(&self, message: impl Into<String>) {
        self.core.report_status(message);
    }

    /// Token cancelled when the job is cancelled. Sub-tasks submitted with a
    /// child of this token are skipped if still queued.
    pub fn cancel_token(&self) -> CancellationToken {
        self.core.cancel_token()
    }
}

/// A job: shared state machine plus kind-specific work, bound to a task
/// engine.
pub struct Job<W: JobWork> {
    core: Arc<JobCore>,
    work: Arc<W>,
    source: EngineSource,
    engine: OnceLock<Arc<TaskEngine>>,
}

impl<W: JobWork> Job<W> {
    /// Run on a caller-owned engine.
    pub fn with_work(work: W, engine: Arc<TaskEngine>) -> Self {
        Self {
            core: Arc::new(JobCore::new(W::KIND)),
            work: Arc::new(work),
            source: EngineSource::Shared,
            engine: OnceLock::from(engine),
        }
    }

    /// Run on an engine of its own: a worker for the coordinating task plus
    /// `max_disks` for disk tasks. No threads exist until `start()`, and
    /// they are released when the job settles.
    pub fn with_dedicated_engine(work: W, max_disks: usize) -> Self {
        Self {
            core: Arc::new(JobCore::new(W::KIND)),
            work: Arc::new(work),
            source: EngineSource::Dedicated {
                workers: max_disks.clamp(1, config::MAX_CONCURRENT_DISKS) + 1,
            },
            engine: OnceLock::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.core.id()
    }

    pub fn kind(&self) -> JobKind {
        self.core.kind()
    }

    pub fn status(&self) -> JobStatus {
        self.core.status()
    }

    pub fn progress(&self) -> u8 {
        self.core.progress()
    }

    /// Human-readable status text.
    pub fn message(&self) -> String {
        self.core.message()
    }

    /// Always `Some` and non-empty when `status()` is `Failed`.
    pub fn error(&self) -> Option<String> {
        self.core.error()
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.core.snapshot()
    }

    pub fn work(&self) -> &W {
        &self.work
    }

    /// The engine the job runs on; `None` for a dedicated engine that has
    /// not been spawned yet.
    pub fn engine(&self) -> Option<&TaskEngine> {
        self.engine.get().map(Arc::as_ref)
    }

    pub fn on_progress(&self, cb: impl Fn(u8) + Send + Sync + 'static) {
        self.core.set_progress_callback(Arc::new(cb));
    }

    pub fn on_status(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.core.set_status_callback(Arc::new(cb));
    }

    /// PENDING → RUNNING (validating and dispatching) or PAUSED → RUNNING.
    ///
    /// Returns `false` without a state change from any other state, and
    /// `false` with the job FAILED when validation or dispatch fails.
    /// Callbacks for the transition fire after the run slot is released, so
    /// they may call back into the job.
    pub fn start(&self) -> bool {
        // Held across dispatch so a concurrent cancel() always sees the handle.
        let mut run = self.core.run_slot();
        let (outcome, notify) = self.core.begin(|| self.work.validate());
        let dispatched = match outcome {
            Begin::Dispatch => Some(self.dispatch().map(|(settled, gate)| {
                *run = Some(settled);
                gate
            })),
            _ => None,
        };
        drop(run);
        notify.fire();

        match (outcome, dispatched) {
            (Begin::Resumed, _) => {
                self.work.on_resume();
                true
            }
            (Begin::Dispatch, Some(Ok(gate))) => {
                gate.mark();
                if let Some(engine) = self.engine.get() {
                    engine.wake();
                }
                true
            }
            (Begin::Dispatch, Some(Err(e))) => {
                self.core.finish(Err(e));
                false
            }
            _ => false,
        }
    }

    /// Submit the coordinating task, held back until `start()` has delivered
    /// the RUNNING notification. Returns the task's settle signal and the
    /// gate that releases it.
    fn dispatch(&self) -> Result<(Settled, Settled), JobError> {
        let (engine, owned) = match &self.source {
            EngineSource::Shared => (self.engine.get().cloned(), false),
            EngineSource::Dedicated { workers } => {
                let spawned = Arc::new(TaskEngine::new(*workers)?);
                (Some(Arc::clone(self.engine.get_or_init(|| spawned))), true)
            }
        };
        let engine = engine.ok_or_else(|| JobError::Config("job has no task engine".into()))?;

        let ctx = JobContext {
            core: Arc::clone(&self.core),
            engine: Arc::clone(&engine),
        };
        let work = Arc::clone(&self.work);
        let gate = Settled::new();
        let options = TaskOptions::priority(Priority::High)
            .with_cancel(self.core.cancel_token())
            .with_prerequisites(vec![gate.clone()]);
        let handle = engine.submit_with(options, move || {
            let result = work.execute(&ctx);
            if owned {
                // Disk tasks have all settled; join the other workers.
                ctx.engine.shutdown();
            }
            ctx.core.finish(result);
            Ok::<(), Infallible>(())
        })?;
        Ok((handle.settled(), gate))
    }

    /// RUNNING → PAUSED. Workers park at their next safe point.
    pub fn pause(&self) -> bool {
        let ok = self.core.pause();
        if ok {
            self.work.on_pause();
        }
        ok
    }

    /// PAUSED → RUNNING.
    pub fn resume(&self) -> bool {
        let ok = self.core.resume();
        if ok {
            self.work.on_resume();
        }
        ok
    }

    /// RUNNING/PAUSED → CANCELLED, then block until the dispatched work has
    /// settled. No callbacks fire after this returns. Refused once the work
    /// has committed its result.
    pub fn cancel(&self) -> bool {
        if !self.core.begin_cancel() {
            return false;
        }
        self.work.on_cancel();
        self.wait();
        true
    }

    /// Block until the dispatched work (if any) has settled.
    pub fn wait(&self) {
        let in_flight = self.core.run_slot().clone();
        if let Some(settled) = in_flight {
            settled.wait();
            self.release_engine();
        }
    }

    /// Join a dedicated engine's workers. Covers runs skipped before their
    /// coordinating task started.
    fn release_engine(&self) {
        if let (EngineSource::Dedicated { .. }, Some(engine)) = (&self.source, self.engine.get()) {
            engine.shutdown();
        }
    }
}

impl<W: JobWork> std::fmt::Debug for Job<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{mpsc, Mutex};
    use std::time::Duration;

    /// Counts to `steps`, one checkpoint per step.
    struct Counter {
        steps: u32,
        step_delay: Duration,
        fail_at: Option<u32>,
        valid: bool,
        done: AtomicU32,
        finished: AtomicBool,
    }

    impl Counter {
        fn new(steps: u32) -> Self {
            Self {
                steps,
                step_delay: Duration::from_millis(5),
                fail_at: None,
                valid: true,
                done: AtomicU32::new(0),
                finished: AtomicBool::new(false),
            }
        }
    }

    impl JobWork for Counter {
        const KIND: JobKind = JobKind::Verify;

        fn validate(&self) -> Result<(), JobError> {
            if self.valid {
                Ok(())
            } else {
                Err(JobError::Config("steps must be positive".into()))
            }
        }

        fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
            for i in 0..self.steps {
                ctx.checkpoint()?;
                if self.fail_at == Some(i) {
                    return Err(JobError::Manifest(format!("step {i} exploded")));
                }
                std::thread::sleep(self.step_delay);
                let n = self.done.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.report_progress((n * 100 / self.steps) as u8);
            }
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(work: Counter) -> Job<Counter> {
        Job::with_work(work, Arc::new(TaskEngine::new(2).unwrap()))
    }

    #[test]
    fn test_start_runs_to_completion() {
        let job = job(Counter::new(5));
        assert_eq!(job.status(), JobStatus::Pending);
        assert!(job.start());
        job.wait();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.progress(), 100);
        assert!(job.work().finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalid_config_fails_without_running() {
        let mut work = Counter::new(5);
        work.valid = false;
        let job = job(work);
        assert!(!job.start());
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(!job.error().unwrap().is_empty());
        assert_eq!(job.work().done.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_worker_failure_sets_error_before_failed() {
        let mut work = Counter::new(5);
        work.fail_at = Some(2);
        let job = job(work);
        assert!(job.start());
        job.wait();
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("step 2 exploded"));
    }

    #[test]
    fn test_cancel_waits_for_settle_and_silences_callbacks() {
        let mut work = Counter::new(1000);
        work.step_delay = Duration::from_millis(2);
        let job = job(work);
        let after_cancel = Arc::new(AtomicBool::new(false));
        let late_callback = Arc::new(AtomicBool::new(false));
        {
            let after_cancel = Arc::clone(&after_cancel);
            let late_callback = Arc::clone(&late_callback);
            job.on_progress(move |_| {
                if after_cancel.load(Ordering::SeqCst) {
                    late_callback.store(true, Ordering::SeqCst);
                }
            });
        }
        assert!(job.start());
        std::thread::sleep(Duration::from_millis(30));
        assert!(job.cancel());
        after_cancel.store(true, Ordering::SeqCst);

        let done_at_cancel = job.work().done.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(job.work().done.load(Ordering::SeqCst), done_at_cancel);
        assert_eq!(job.status(), JobStatus::Cancelled);
        assert!(!late_callback.load(Ordering::SeqCst));
        assert!(job.error().is_none());
    }

    #[test]
    fn test_terminal_state_rejects_every_control_call() {
        let job = job(Counter::new(1));
        assert!(job.start());
        job.wait();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(!job.start());
        assert!(!job.pause());
        assert!(!job.resume());
        assert!(!job.cancel());
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_pause_resume_progress_never_regresses() {
        let mut work = Counter::new(50);
        work.step_delay = Duration::from_millis(2);
        let job = job(work);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            job.on_progress(move |p| seen.lock().unwrap().push(p));
        }
        assert!(job.start());
        std::thread::sleep(Duration::from_millis(20));
        assert!(job.pause());
        let frozen = job.work().done.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(150));
        // At most one in-flight step completes after pausing.
        assert!(job.work().done.load(Ordering::SeqCst) <= frozen + 1);
        assert_eq!(job.status(), JobStatus::Paused);

        // start() from PAUSED resumes.
        assert!(job.start());
        job.wait();
        assert_eq!(job.status(), JobStatus::Completed);

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_cancel_pending_job_is_rejected() {
        let job = job(Counter::new(1));
        assert!(!job.cancel());
        assert_eq!(job.status(), JobStatus::Pending);
    }

    #[test]
    fn test_start_on_shut_down_engine_fails_job() {
        let engine = Arc::new(TaskEngine::new(1).unwrap());
        engine.shutdown();
        let job = Job::with_work(Counter::new(1), engine);
        assert!(!job.start());
        assert_eq!(job.status(), JobStatus::Failed);
        assert!(job.error().unwrap().contains("shutting down"));
    }

    #[test]
    fn test_dedicated_engine_spawns_on_start_and_stops_on_settle() {
        let job = Job::with_dedicated_engine(Counter::new(3), 2);
        assert!(job.engine().is_none());
        assert!(job.start());
        assert_eq!(job.engine().map(TaskEngine::worker_count), Some(3));
        job.wait();
        assert_eq!(job.status(), JobStatus::Completed);
        assert!(job.engine().unwrap().is_shutting_down());
    }

    #[test]
    fn test_dedicated_engine_released_after_cancel() {
        let mut work = Counter::new(1000);
        work.step_delay = Duration::from_millis(2);
        let job = Job::with_dedicated_engine(work, 1);
        assert!(job.start());
        std::thread::sleep(Duration::from_millis(20));
        assert!(job.cancel());
        assert!(job.engine().unwrap().is_shutting_down());
    }

    #[test]
    fn test_shared_engine_outlives_job() {
        let engine = Arc::new(TaskEngine::new(2).unwrap());
        let job = Job::with_work(Counter::new(2), Arc::clone(&engine));
        assert!(job.start());
        job.wait();
        assert!(!engine.is_shutting_down());
        assert_eq!(engine.submit(|| Ok::<_, ()>(7)).unwrap().wait().unwrap(), 7);
    }

    #[test]
    fn test_status_callback_may_call_back_into_job() {
        let job = Arc::new(job(Counter::new(20)));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let weak = Arc::downgrade(&job);
            let seen = Arc::clone(&seen);
            job.on_status(move |msg| {
                if let Some(job) = weak.upgrade() {
                    seen.lock().unwrap().push((msg.to_string(), job.status()));
                    if msg == "Running" {
                        // Takes the run slot; must not deadlock inside start().
                        assert!(job.cancel());
                    }
                }
            });
        }
        assert!(job.start());
        job.wait();
        assert_eq!(job.status(), JobStatus::Cancelled);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], ("Running".to_string(), JobStatus::Running));
        assert_eq!(job.work().done.load(Ordering::SeqCst), 0);
    }

    /// Commits straight away, then blocks until released.
    struct Committer {
        committed: mpsc::SyncSender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl JobWork for Committer {
        const KIND: JobKind = JobKind::Backup;

        fn validate(&self) -> Result<(), JobError> {
            Ok(())
        }

        fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
            ctx.commit()?;
            let _ = self.committed.send(());
            let _ = self.release.lock().unwrap().recv();
            Ok(())
        }
    }

    #[test]
    fn test_cancel_after_commit_is_refused() {
        let (committed_tx, committed_rx) = mpsc::sync_channel(1);
        let (release_tx, release_rx) = mpsc::channel();
        let job = Job::with_work(
            Committer {
                committed: committed_tx,
                release: Mutex::new(release_rx),
            },
            Arc::new(TaskEngine::new(1).unwrap()),
        );
        assert!(job.start());
        committed_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        assert!(!job.cancel());
        assert!(!job.pause());
        assert_eq!(job.status(), JobStatus::Running);

        release_tx.send(()).unwrap();
        job.wait();
        assert_eq!(job.status(), JobStatus::Completed);
    }
}
