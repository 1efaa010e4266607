// crates/core/src/engine/types.rs
//! Value types shared by the task engine and its callers.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// Scheduling priority of a task. Higher variants dequeue first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

/// Why a submitted task did not produce a value.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    #[error("Task failed: {0}")]
    Failed(E),

    #[error("Task was cancelled before it ran")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),
}

/// Point-in-time counters for one engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total_enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_duration_ms: f64,
    pub current_queue_depth: usize,
}

/// Write side of a task's progress, handed to the work closure.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    percent: Arc<AtomicU8>,
}

/// Read side of a task's progress. Safe to poll from any thread.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    percent: Arc<AtomicU8>,
}

pub(crate) fn progress_pair() -> (ProgressSink, ProgressHandle) {
    let percent = Arc::new(AtomicU8::new(0));
    (
        ProgressSink {
            percent: Arc::clone(&percent),
        },
        ProgressHandle { percent },
    )
}

impl ProgressSink {
    /// Record progress, clamped to 0..=100.
    pub fn set(&self, percent: u8) {
        self.percent.store(percent.min(100), Ordering::Relaxed);
    }

    /// Record progress as `done / total`.
    pub fn set_fraction(&self, done: u64, total: u64) {
        let pct = if total == 0 {
            100
        } else {
            ((done.min(total) as u128 * 100) / total as u128) as u8
        };
        self.set(pct);
    }
}

impl ProgressHandle {
    pub fn get(&self) -> u8 {
        self.percent.load(Ordering::Relaxed)
    }
}
