//! Cooperative safepoint signal
//!
//! Compiled loops poll the engine's [`Safepoint`] on every back edge. A
//! cancellation request is sticky until [`Safepoint::clear`]; a
//! deoptimisation request is consumed by the first compiled poll that sees
//! it.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use crate::frame::{ExecError, ExecResult, Frame};

const IDLE: u8 = 0;
const DEOPTIMIZE: u8 = 1;
const CANCEL: u8 = 2;

#[derive(Debug, Default)]
pub struct Safepoint {
    pending: AtomicU8,
    reason: Mutex<String>,
}

impl Safepoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every poll fail with [`ExecError::Cancelled`]
    pub fn request_cancel(&self, reason: impl Into<String>) {
        *self.reason.lock() = reason.into();
        self.pending.store(CANCEL, Ordering::Release);
    }

    /// Make the next compiled poll fail with [`ExecError::Deoptimize`]
    pub fn request_deoptimization(&self, reason: impl Into<String>) {
        let mut slot = self.reason.lock();
        // A pending cancel wins over a deopt.
        if self
            .pending
            .compare_exchange(IDLE, DEOPTIMIZE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *slot = reason.into();
        }
    }

    /// Drop any pending request
    pub fn clear(&self) {
        self.pending.store(IDLE, Ordering::Release);
    }

    /// Whether any request is pending
    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire) != IDLE
    }

    /// Poll point. Deoptimisation requests only apply to compiled frames;
    /// interpreted frames leave them pending.
    #[inline]
    pub fn poll(&self, frame: &Frame) -> ExecResult<()> {
        match self.pending.load(Ordering::Acquire) {
            IDLE => Ok(()),
            CANCEL => Err(ExecError::Cancelled(self.reason.lock().clone())),
            _ if frame.state().is_compiled() => self.take_deoptimization(),
            _ => Ok(()),
        }
    }

    #[cold]
    fn take_deoptimization(&self) -> ExecResult<()> {
        let reason = self.reason.lock();
        match self
            .pending
            .compare_exchange(DEOPTIMIZE, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Err(ExecError::Deoptimize {
                reason: reason.clone(),
                speculation: None,
            }),
            // Raced with another poller or with a cancel request.
            Err(CANCEL) => Err(ExecError::Cancelled(reason.clone())),
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CompilationState;

    fn compiled_frame() -> Frame {
        let mut frame = Frame::new([]);
        frame.enter_state(CompilationState::Tier2Root);
        frame
    }

    #[test]
    fn test_idle_poll_passes() {
        let sp = Safepoint::new();
        assert!(sp.poll(&Frame::new([])).is_ok());
        assert!(!sp.is_pending());
    }

    #[test]
    fn test_cancel_is_sticky() {
        let sp = Safepoint::new();
        sp.request_cancel("shutdown");
        let frame = Frame::new([]);
        for _ in 0..3 {
            match sp.poll(&frame) {
                Err(ExecError::Cancelled(reason)) => assert_eq!(reason, "shutdown"),
                other => panic!("Expected Cancelled, got {:?}", other),
            }
        }
        sp.clear();
        assert!(sp.poll(&frame).is_ok());
    }

    #[test]
    fn test_deoptimization_is_one_shot_and_compiled_only() {
        let sp = Safepoint::new();
        sp.request_deoptimization("debugger attached");

        // Interpreted frames leave the request pending.
        assert!(sp.poll(&Frame::new([])).is_ok());
        assert!(sp.is_pending());

        let frame = compiled_frame();
        assert!(matches!(sp.poll(&frame), Err(ExecError::Deoptimize { .. })));
        assert!(sp.poll(&frame).is_ok());
    }

    #[test]
    fn test_cancel_overrides_deoptimization() {
        let sp = Safepoint::new();
        sp.request_cancel("stop");
        sp.request_deoptimization("ignored");
        assert!(matches!(
            sp.poll(&compiled_frame()),
            Err(ExecError::Cancelled(_))
        ));
    }
}
