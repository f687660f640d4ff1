//! Guest code contracts
//!
//! The engine never interprets guest code. Guest languages hand it a
//! [`UnitBody`] per compilable unit and a [`RepeatingBody`] per loop.

use std::fmt;

use crate::frame::{ExecResult, Frame, LoopStatus, Value};

/// Interpreter entry of a compilable unit
pub trait UnitBody: Send + Sync {
    /// Display name, matched against the compile-only filter
    fn name(&self) -> &str;

    /// Run one activation against the frame
    fn execute(&self, frame: &mut Frame) -> ExecResult<Value>;

    /// Rough size, reported as code size by the reference backend
    fn size(&self) -> usize {
        1
    }
}

/// One iteration of a loop body, condition included
pub trait RepeatingBody: Send + Sync {
    fn name(&self) -> &str {
        "loop"
    }

    /// Run one iteration. `Continue` asks for another one.
    fn execute_repeating(&self, frame: &mut Frame) -> ExecResult<LoopStatus>;
}

/// [`UnitBody`] backed by a closure
pub struct FnBody<F> {
    name: String,
    f: F,
}

impl<F> FnBody<F>
where
    F: Fn(&mut Frame) -> ExecResult<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnBody {
            name: name.into(),
            f,
        }
    }
}

impl<F> UnitBody for FnBody<F>
where
    F: Fn(&mut Frame) -> ExecResult<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, frame: &mut Frame) -> ExecResult<Value> {
        (self.f)(frame)
    }
}

impl<F> fmt::Debug for FnBody<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBody").field("name", &self.name).finish()
    }
}

/// [`RepeatingBody`] backed by a closure
pub struct FnLoop<F> {
    name: String,
    f: F,
}

impl<F> FnLoop<F>
where
    F: Fn(&mut Frame) -> ExecResult<LoopStatus> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnLoop {
            name: name.into(),
            f,
        }
    }
}

impl<F> RepeatingBody for FnLoop<F>
where
    F: Fn(&mut Frame) -> ExecResult<LoopStatus> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute_repeating(&self, frame: &mut Frame) -> ExecResult<LoopStatus> {
        (self.f)(frame)
    }
}

impl<F> fmt::Debug for FnLoop<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnLoop").field("name", &self.name).finish()
    }
}
