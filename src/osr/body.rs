//! Loop body as a compilable unit
//!
//! An OSR unit's body runs the loop from the live frame to completion,
//! polling the safepoint on every back edge. A loop that finishes yields its
//! break value; the OSR controller reads [`Value::LoopContinue`] as
//! "hand control back to the interpreter".

use std::sync::Arc;

use crate::engine::safepoint::Safepoint;
use crate::frame::{ExecResult, Frame, LoopStatus, Value};
use crate::unit::{RepeatingBody, UnitBody};

pub(crate) struct OsrLoopBody {
    name: Arc<str>,
    body: Arc<dyn RepeatingBody>,
    safepoint: Arc<Safepoint>,
}

impl OsrLoopBody {
    pub(crate) fn new(name: Arc<str>, body: Arc<dyn RepeatingBody>, safepoint: Arc<Safepoint>) -> Self {
        OsrLoopBody {
            name,
            body,
            safepoint,
        }
    }
}

impl UnitBody for OsrLoopBody {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, frame: &mut Frame) -> ExecResult<Value> {
        loop {
            match self.body.execute_repeating(frame)? {
                LoopStatus::Continue => self.safepoint.poll(frame)?,
                done @ LoopStatus::Break(_) => return Ok(done.into_value()),
            }
        }
    }
}
