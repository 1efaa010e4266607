// crates/core/src/job/fanout.rs
//! Per-disk fan-out onto a job's task engine.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::JobContext;
use crate::engine::{Priority, TaskError, TaskOptions};
use crate::error::JobError;

/// Worker-side view of one per-disk task.
pub(crate) struct DiskScope<'a> {
    pub ctx: &'a JobContext,
    abort: &'a CancellationToken,
}

impl DiskScope<'_> {
    /// Safe point between chunks: stops if a sibling failed or the job was
    /// cancelled, parks while the job is paused.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.abort.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        self.ctx.checkpoint()
    }
}

/// Cancels the fan-out if its task unwinds.
struct AbortOnPanic<'a>(&'a CancellationToken);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.cancel();
        }
    }
}

/// Run `work` once per item on the job's engine and collect the results in
/// item order.
///
/// Fail-fast: the first real failure cancels the tasks still queued and
/// stops running siblings at their next checkpoint, but every submitted
/// task has settled before this returns. A real failure takes precedence
/// over the `Cancelled` errors it induces in siblings.
pub(crate) fn run_per_disk<I, T, F>(
    ctx: &JobContext,
    items: Vec<I>,
    work: F,
) -> Result<Vec<T>, JobError>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I, &DiskScope<'_>) -> Result<T, JobError> + Send + Sync + 'static,
{
    let abort = ctx.cancel_token().child_token();
    let work = Arc::new(work);
    let mut handles = Vec::with_capacity(items.len());
    let mut failure: Option<JobError> = None;

    for item in items {
        let task_ctx = ctx.clone();
        let task_abort = abort.clone();
        let work = Arc::clone(&work);
        let options = TaskOptions::priority(Priority::Normal).with_cancel(abort.clone());
        let submitted = ctx.engine().submit_with(options, move || {
            let _guard = AbortOnPanic(&task_abort);
            let scope = DiskScope {
                ctx: &task_ctx,
                abort: &task_abort,
            };
            let result = work(item, &scope);
            if let Err(e) = &result {
                if !e.is_cancellation() {
                    tracing::warn!(job_id = %task_ctx.job_id(), error = %e, "Disk task failed, aborting siblings");
                    task_abort.cancel();
                }
            }
            result
        });
        match submitted {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                abort.cancel();
                failure = Some(e.into());
                break;
            }
        }
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let err = match handle.wait() {
            Ok(value) => {
                results.push(value);
                continue;
            }
            Err(TaskError::Failed(e)) => e,
            Err(TaskError::Cancelled) => JobError::Cancelled,
            Err(TaskError::Panicked(msg)) => JobError::TaskPanicked(msg),
        };
        failure = match failure {
            Some(prev) if !prev.is_cancellation() || err.is_cancellation() => Some(prev),
            _ => Some(err),
        };
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
