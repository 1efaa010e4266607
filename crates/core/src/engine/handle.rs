// crates/core/src/engine/handle.rs
//! Completion handles for submitted tasks.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use super::types::TaskError;

/// Cloneable "has this task settled?" signal.
///
/// A task settles when it finishes (successfully or not), is skipped due to
/// cancellation, or panics. Used as a prerequisite for dependent tasks and by
/// jobs waiting for in-flight work.
#[derive(Debug, Clone, Default)]
pub struct Settled {
    inner: Arc<SettledInner>,
}

#[derive(Debug, Default)]
struct SettledInner {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Settled {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal that is already settled.
    pub fn settled() -> Self {
        let s = Self::new();
        s.mark();
        s
    }

    pub fn is_settled(&self) -> bool {
        *self.inner.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until settled.
    pub fn wait(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.inner.cv.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until settled or the timeout elapses. Returns whether it settled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let done = self.inner.done.lock().unwrap_or_else(PoisonError::into_inner);
        let (done, _) = self
            .inner
            .cv
            .wait_timeout_while(done, timeout, |d| !*d)
            .unwrap_or_else(PoisonError::into_inner);
        *done
    }

    pub(crate) fn mark(&self) {
        let mut done = self.inner.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.inner.cv.notify_all();
    }
}

/// Slot the worker fills with the task's result before marking it settled.
pub(crate) struct ResultSlot<T, E> {
    value: Mutex<Option<Result<T, TaskError<E>>>>,
    settled: Settled,
}

impl<T, E> ResultSlot<T, E> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            settled: Settled::new(),
        })
    }

    pub(crate) fn fill(&self, result: Result<T, TaskError<E>>) {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.settled.mark();
    }
}

/// Handle resolving to a task's value or the reason it produced none.
pub struct TaskHandle<T, E> {
    slot: Arc<ResultSlot<T, E>>,
}

impl<T, E> TaskHandle<T, E> {
    pub(crate) fn new(slot: Arc<ResultSlot<T, E>>) -> Self {
        Self { slot }
    }

    /// A signal for use as a prerequisite or for waiting without consuming
    /// the handle.
    pub fn settled(&self) -> Settled {
        self.slot.settled.clone()
    }

    pub fn is_settled(&self) -> bool {
        self.slot.settled.is_settled()
    }

    /// Block until the task settles and take its result.
    pub fn wait(self) -> Result<T, TaskError<E>> {
        self.slot.settled.wait();
        self.slot
            .value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or(Err(TaskError::Cancelled))
    }
}

impl<T, E> std::fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_settled_wakes_waiters() {
        let s = Settled::new();
        let s2 = s.clone();
        let t = thread::spawn(move || {
            s2.wait();
            true
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!s.is_settled());
        s.mark();
        assert!(t.join().unwrap());
        assert!(s.is_settled());
    }

    #[test]
    fn test_settled_wait_timeout() {
        let s = Settled::new();
        assert!(!s.wait_timeout(Duration::from_millis(10)));
        assert!(Settled::settled().wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_handle_returns_filled_value() {
        let slot = ResultSlot::<u32, String>::new();
        let handle = TaskHandle::new(Arc::clone(&slot));
        assert!(!handle.is_settled());
        slot.fill(Ok(7));
        assert!(handle.is_settled());
        assert_eq!(handle.wait().unwrap(), 7);
    }
}
