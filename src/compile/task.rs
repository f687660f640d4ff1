//! Compile task handle
//!
//! Resolves exactly once, on whatever thread finished the compilation.
//! Callers can poll it, block on it, or `.await` it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::CompileFailure;
use crate::state::CompileTier;

/// Terminal result of a compile request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    Succeeded(CompileTier),
    Failed(CompileFailure),
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Succeeded(_))
    }

    pub fn failure(&self) -> Option<&CompileFailure> {
        match self {
            CompileOutcome::Succeeded(_) => None,
            CompileOutcome::Failed(failure) => Some(failure),
        }
    }
}

#[derive(Debug, Default)]
struct TaskState {
    outcome: Option<CompileOutcome>,
    wakers: Vec<Waker>,
}

#[derive(Debug)]
struct TaskInner {
    tier: CompileTier,
    cancelled: AtomicBool,
    state: Mutex<TaskState>,
    done: Condvar,
}

/// Shared handle to one compile request
#[derive(Debug, Clone)]
pub struct CompileTask {
    inner: Arc<TaskInner>,
}

impl CompileTask {
    pub(crate) fn new(tier: CompileTier) -> Self {
        CompileTask {
            inner: Arc::new(TaskInner {
                tier,
                cancelled: AtomicBool::new(false),
                state: Mutex::new(TaskState::default()),
                done: Condvar::new(),
            }),
        }
    }

    pub fn tier(&self) -> CompileTier {
        self.inner.tier
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Outcome if already resolved
    pub fn outcome(&self) -> Option<CompileOutcome> {
        self.inner.state.lock().outcome.clone()
    }

    /// Block until resolved
    pub fn wait(&self) -> CompileOutcome {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Block until resolved or the timeout elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompileOutcome> {
        let mut state = self.inner.state.lock();
        if state.outcome.is_none() {
            self.inner.done.wait_while_for(&mut state, |s| s.outcome.is_none(), timeout);
        }
        state.outcome.clone()
    }

    /// Request cancellation. Returns false if the task already finished.
    ///
    /// The task still resolves normally; a cancelled request resolves as
    /// [`CompileFailure::Cancelled`] unless it had already finished.
    pub fn cancel(&self) -> bool {
        let state = self.inner.state.lock();
        if state.outcome.is_some() {
            return false;
        }
        self.inner.cancelled.store(true, Ordering::Release);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same request
    pub fn ptr_eq(&self, other: &CompileTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolve; later calls are ignored
    pub(crate) fn resolve(&self, outcome: CompileOutcome) -> bool {
        let wakers = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.wakers)
        };
        self.inner.done.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl Future for CompileTask {
    type Output = CompileOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolves_once() {
        let task = CompileTask::new(CompileTier::First);
        assert!(!task.is_done());
        assert!(task.resolve(CompileOutcome::Succeeded(CompileTier::First)));
        assert!(!task.resolve(CompileOutcome::Failed(CompileFailure::Cancelled)));
        assert_eq!(task.outcome(), Some(CompileOutcome::Succeeded(CompileTier::First)));
    }

    #[test]
    fn test_wait_across_threads() {
        let task = CompileTask::new(CompileTier::Last);
        let remote = task.clone();
        let handle = thread::spawn(move || {
            remote.resolve(CompileOutcome::Succeeded(CompileTier::Last));
        });
        assert_eq!(task.wait(), CompileOutcome::Succeeded(CompileTier::Last));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_on_pending() {
        let task = CompileTask::new(CompileTier::First);
        assert_eq!(task.wait_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_cancel_after_done_is_noop() {
        let task = CompileTask::new(CompileTier::First);
        task.resolve(CompileOutcome::Failed(CompileFailure::Internal("x".into())));
        assert!(!task.cancel());
        assert!(!task.is_cancelled());

        let pending = CompileTask::new(CompileTier::First);
        assert!(pending.cancel());
        assert!(pending.is_cancelled());
        assert!(pending.ptr_eq(&pending.clone()));
        assert!(!pending.ptr_eq(&task));
    }
}
