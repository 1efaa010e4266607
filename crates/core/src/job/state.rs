// crates/core/src/job/state.rs
//! Per-job state machine guarded by a single lock.
//!
//! Status, progress, message and error are only ever read and written under
//! `JobCore::inner`. Callbacks are cloned out under the lock and invoked after
//! it is released.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::types::{
    JobId, JobKind, JobSnapshot, JobStatus, ProgressCallback, StatusCallback,
};
use crate::engine::Settled;
use crate::error::JobError;

/// How long a paused worker sleeps between checks.
const PAUSE_POLL: Duration = Duration::from_millis(100);

pub(crate) struct JobCore {
    id: JobId,
    kind: JobKind,
    inner: Mutex<JobInner>,
    pause_cv: Condvar,
    cancel: CancellationToken,
    /// Settle signal of the dispatched run, if any. Locked before `inner`
    /// when both are needed.
    run: Mutex<Option<Settled>>,
}

struct JobInner {
    status: JobStatus,
    progress: u8,
    message: String,
    error: Option<String>,
    /// Set once the work passed its commit point; cancel and pause are
    /// refused from then on.
    committed: bool,
    on_progress: Option<ProgressCallback>,
    on_status: Option<StatusCallback>,
}

/// Result of a `start()` attempt.
pub(crate) enum Begin {
    /// PENDING → RUNNING; the caller must dispatch the work.
    Dispatch,
    /// PAUSED → RUNNING; work is already in flight.
    Resumed,
    /// Validation failed; the job is now FAILED.
    Invalid,
    /// Not startable from the current state.
    Rejected,
}

/// Notifications to deliver once the lock is released.
#[derive(Default)]
#[must_use = "callbacks only run when the notification is fired"]
pub(crate) struct Notify {
    progress: Option<(ProgressCallback, u8)>,
    status: Option<(StatusCallback, String)>,
}

impl Notify {
    pub(crate) fn fire(self) {
        if let Some((cb, pct)) = self.progress {
            cb(pct);
        }
        if let Some((cb, msg)) = self.status {
            cb(&msg);
        }
    }
}

impl JobInner {
    fn set_message(&mut self, msg: impl Into<String>, notify: &mut Notify) {
        self.message = msg.into();
        notify.status = self
            .on_status
            .clone()
            .map(|cb| (cb, self.message.clone()));
    }
}

impl JobCore {
    pub(crate) fn new(kind: JobKind) -> Self {
        Self {
            id: JobId::generate(),
            kind,
            inner: Mutex::new(JobInner {
                status: JobStatus::Pending,
                progress: 0,
                message: "Pending".to_string(),
                error: None,
                committed: false,
                on_progress: None,
                on_status: None,
            }),
            pause_cv: Condvar::new(),
            cancel: CancellationToken::new(),
            run: Mutex::new(None),
        }
    }

    fn inner(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn run_slot(&self) -> MutexGuard<'_, Option<Settled>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- Accessors ------------------------------------------------------------

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn kind(&self) -> JobKind {
        self.kind
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.inner().status
    }

    pub(crate) fn progress(&self) -> u8 {
        self.inner().progress
    }

    pub(crate) fn message(&self) -> String {
        self.inner().message.clone()
    }

    pub(crate) fn error(&self) -> Option<String> {
        self.inner().error.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        let inner = self.inner();
        JobSnapshot {
            job_id: self.id,
            job_type: self.kind,
            status: inner.status,
            progress: inner.progress,
            message: inner.message.clone(),
            error: inner.error.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub(crate) fn set_progress_callback(&self, cb: ProgressCallback) {
        self.inner().on_progress = Some(cb);
    }

    pub(crate) fn set_status_callback(&self, cb: StatusCallback) {
        self.inner().on_status = Some(cb);
    }

    // -- Control transitions --------------------------------------------------

    /// Apply a `start()` transition. The returned notification is left to the
    /// caller so it can fire after releasing the run slot.
    pub(crate) fn begin(
        &self,
        validate: impl FnOnce() -> Result<(), JobError>,
    ) -> (Begin, Notify) {
        let mut notify = Notify::default();
        let outcome = {
            let mut inner = self.inner();
            match inner.status {
                JobStatus::Pending => match validate() {
                    Ok(()) => {
                        inner.status = JobStatus::Running;
                        inner.set_message("Running", &mut notify);
                        Begin::Dispatch
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        inner.error = Some(msg.clone());
                        inner.status = JobStatus::Failed;
                        inner.set_message(msg, &mut notify);
                        Begin::Invalid
                    }
                },
                JobStatus::Paused => {
                    inner.status = JobStatus::Running;
                    inner.set_message("Running", &mut notify);
                    self.pause_cv.notify_all();
                    Begin::Resumed
                }
                _ => Begin::Rejected,
            }
        };
        match outcome {
            Begin::Dispatch | Begin::Resumed => {
                tracing::info!(job_id = %self.id, kind = %self.kind, "Job running")
            }
            Begin::Invalid => tracing::warn!(
                job_id = %self.id,
                kind = %self.kind,
                error = ?self.error(),
                "Job configuration rejected"
            ),
            Begin::Rejected => {}
        }
        (outcome, notify)
    }

    pub(crate) fn pause(&self) -> bool {
        if self.inner().committed {
            return false;
        }
        self.swap_status(JobStatus::Running, JobStatus::Paused, "Paused")
    }

    pub(crate) fn resume(&self) -> bool {
        let ok = self.swap_status(JobStatus::Paused, JobStatus::Running, "Running");
        if ok {
            self.pause_cv.notify_all();
        }
        ok
    }

    /// RUNNING/PAUSED → CANCELLED. Does not wait; see `Job::cancel`.
    /// Refused once the work has committed.
    pub(crate) fn begin_cancel(&self) -> bool {
        let mut notify = Notify::default();
        {
            let mut inner = self.inner();
            if !inner.status.is_active() || inner.committed {
                return false;
            }
            inner.status = JobStatus::Cancelled;
            inner.set_message("Cancelled", &mut notify);
        }
        self.cancel.cancel();
        self.pause_cv.notify_all();
        tracing::info!(job_id = %self.id, kind = %self.kind, "Job cancelled");
        notify.fire();
        true
    }

    fn swap_status(&self, from: JobStatus, to: JobStatus, message: &str) -> bool {
        let mut notify = Notify::default();
        {
            let mut inner = self.inner();
            if inner.status != from {
                return false;
            }
            inner.status = to;
            inner.set_message(message, &mut notify);
        }
        tracing::info!(job_id = %self.id, kind = %self.kind, status = %to, "Job state changed");
        notify.fire();
        true
    }

    /// Settle the job from its own worker. No-op unless the job is still
    /// running or paused, so a cancelled job stays cancelled.
    pub(crate) fn finish(&self, result: Result<(), JobError>) {
        let mut notify = Notify::default();
        {
            let mut inner = self.inner();
            if !inner.status.is_active() {
                return;
            }
            match &result {
                Ok(()) => {
                    if inner.progress != 100 {
                        inner.progress = 100;
                        notify.progress = inner.on_progress.clone().map(|cb| (cb, 100));
                    }
                    inner.status = JobStatus::Completed;
                    inner.set_message("Completed", &mut notify);
                }
                Err(e) if e.is_cancellation() => {
                    inner.status = JobStatus::Cancelled;
                    inner.set_message("Cancelled", &mut notify);
                }
                Err(e) => {
                    let msg = e.to_string();
                    // Error first, then the state flip, under the same lock.
                    inner.error = Some(msg.clone());
                    inner.status = JobStatus::Failed;
                    inner.set_message(msg, &mut notify);
                }
            }
        }
        match &result {
            Ok(()) => tracing::info!(job_id = %self.id, kind = %self.kind, "Job completed"),
            Err(e) if e.is_cancellation() => {
                tracing::info!(job_id = %self.id, kind = %self.kind, "Job cancelled by worker")
            }
            Err(e) => tracing::error!(job_id = %self.id, kind = %self.kind, error = %e, "Job failed"),
        }
        notify.fire();
    }

    // -- Worker-side reporting ------------------------------------------------

    /// Raise overall progress. Never decreases; ignored once terminal.
    pub(crate) fn report_progress(&self, percent: u8) {
        let percent = percent.min(100);
        let cb = {
            let mut inner = self.inner();
            if inner.status.is_terminal() || percent <= inner.progress {
                return;
            }
            inner.progress = percent;
            inner.on_progress.clone()
        };
        if let Some(cb) = cb {
            cb(percent);
        }
    }

    /// Replace the status text. Ignored once terminal.
    pub(crate) fn report_status(&self, message: impl Into<String>) {
        let mut notify = Notify::default();
        {
            let mut inner = self.inner();
            if inner.status.is_terminal() {
                return;
            }
            inner.set_message(message, &mut notify);
        }
        notify.fire();
    }

    /// Safe point for workers: returns immediately while running, parks while
    /// paused, and reports cancellation once the job left the active states.
    pub(crate) fn checkpoint(&self) -> Result<(), JobError> {
        let mut inner = self.inner();
        loop {
            match inner.status {
                JobStatus::Running => return Ok(()),
                JobStatus::Paused => {
                    inner = self
                        .pause_cv
                        .wait_timeout(inner, PAUSE_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                _ => return Err(JobError::Cancelled),
            }
        }
    }

    /// Final safe point. Behaves like `checkpoint` until the job is seen
    /// running, then marks it committed under the same lock so no cancel
    /// can slip in between.
    pub(crate) fn commit(&self) -> Result<(), JobError> {
        let mut inner = self.inner();
        loop {
            match inner.status {
                JobStatus::Running => {
                    inner.committed = true;
                    tracing::debug!(job_id = %self.id, kind = %self.kind, "Job committed");
                    return Ok(());
                }
                JobStatus::Paused => {
                    inner = self
                        .pause_cv
                        .wait_timeout(inner, PAUSE_POLL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                _ => return Err(JobError::Cancelled),
            }
        }
    }
}
