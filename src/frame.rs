//! Activations, guest values and execution errors.
//!
//! A [`Frame`] is the live state of one activation. It carries the
//! [`CompilationState`] the activation is running in, which external
//! tooling can query through [`Frame::info`] without touching counters or
//! triggering compilation.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::compile::CompileFailure;
use crate::state::CompilationState;
use crate::unit::speculation::SpeculationId;

// =============================================================================
// Values
// =============================================================================

/// A guest value as seen by the engine.
///
/// The engine is language-agnostic; this is the minimal value set needed to
/// pass arguments in, results out and loop status between interpreted and
/// compiled code.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absent value
    #[default]
    Nil,

    /// Boolean
    Bool(bool),

    /// 64-bit integer
    Int(i64),

    /// Float
    Float(f64),

    /// Immutable string
    Str(Arc<str>),

    /// Loop-continue marker returned by an OSR unit that handed control
    /// back before its loop finished
    LoopContinue,
}

impl Value {
    /// Integer payload, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean payload, if any
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Arc::from(s))
    }
}

/// Result of one loop iteration or of a whole loop
#[derive(Debug, Clone, PartialEq)]
pub enum LoopStatus {
    /// Run another iteration
    Continue,

    /// The loop finished with this value
    Break(Value),
}

impl LoopStatus {
    /// Whether the loop should keep going
    #[inline]
    pub fn should_continue(&self) -> bool {
        matches!(self, LoopStatus::Continue)
    }

    /// Encode as a value so it can cross a unit boundary
    pub fn into_value(self) -> Value {
        match self {
            LoopStatus::Continue => Value::LoopContinue,
            LoopStatus::Break(value) => value,
        }
    }

    /// Decode a value returned by an OSR unit
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::LoopContinue => LoopStatus::Continue,
            other => LoopStatus::Break(other),
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Live state of one activation
#[derive(Debug, Clone, Default)]
pub struct Frame {
    arguments: SmallVec<[Value; 4]>,
    locals: SmallVec<[Value; 8]>,
    state: CompilationState,
}

impl Frame {
    /// Create an interpreted frame for the given arguments
    pub fn new(arguments: impl IntoIterator<Item = Value>) -> Self {
        Frame {
            arguments: arguments.into_iter().collect(),
            locals: SmallVec::new(),
            state: CompilationState::Interpreted,
        }
    }

    /// Arguments the activation was entered with
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// A single argument, `Nil` when out of range
    pub fn argument(&self, index: usize) -> Value {
        self.arguments.get(index).cloned().unwrap_or_default()
    }

    /// Read a local slot, `Nil` when never written
    pub fn local(&self, slot: usize) -> Value {
        self.locals.get(slot).cloned().unwrap_or_default()
    }

    /// Write a local slot, growing the frame as needed
    pub fn set_local(&mut self, slot: usize, value: Value) {
        if slot >= self.locals.len() {
            self.locals.resize(slot + 1, Value::Nil);
        }
        self.locals[slot] = value;
    }

    /// Integer stored in a local slot (0 when unset or not an integer)
    pub fn local_int(&self, slot: usize) -> i64 {
        self.locals.get(slot).and_then(Value::as_int).unwrap_or(0)
    }

    /// Current compilation state of the activation
    #[inline]
    pub fn state(&self) -> CompilationState {
        self.state
    }

    /// Tier the activation runs at
    #[inline]
    pub fn tier(&self) -> u8 {
        self.state.tier()
    }

    /// Whether the activation is the root of a compilation
    #[inline]
    pub fn is_compilation_root(&self) -> bool {
        self.state.is_compilation_root()
    }

    /// Read-only snapshot for debuggers and observability tooling
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            state: self.state,
            tier: self.state.tier(),
            is_compilation_root: self.state.is_compilation_root(),
        }
    }

    /// Switch state for the duration of a call, returning the previous one
    pub(crate) fn enter_state(&mut self, state: CompilationState) -> CompilationState {
        std::mem::replace(&mut self.state, state)
    }
}

/// Introspection view of an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    /// Compilation state
    pub state: CompilationState,
    /// Tier derived from the state
    pub tier: u8,
    /// Whether the activation is a compilation root
    pub is_compilation_root: bool,
}

// =============================================================================
// ExecResult and ExecError
// =============================================================================

/// Errors raised while executing guest code
#[derive(Debug, Clone)]
pub enum ExecError {
    /// Error raised by the guest program itself
    Guest(String),

    /// Compiled code hit a failed speculation and must leave compiled code
    Deoptimize {
        reason: String,
        speculation: Option<SpeculationId>,
    },

    /// Execution was cancelled at a safepoint
    Cancelled(String),

    /// Synchronous compilation failed and the engine is configured to report it
    CompilationFailed(CompileFailure),
}

impl ExecError {
    /// Deoptimisation caused by a specific speculation
    pub fn speculation_failed(speculation: SpeculationId, reason: impl Into<String>) -> Self {
        ExecError::Deoptimize {
            reason: reason.into(),
            speculation: Some(speculation),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Guest(msg) => write!(f, "Guest error: {}", msg),
            ExecError::Deoptimize {
                reason,
                speculation: Some(id),
            } => write!(f, "Deoptimized ({}): {}", id, reason),
            ExecError::Deoptimize { reason, .. } => write!(f, "Deoptimized: {}", reason),
            ExecError::Cancelled(reason) => write!(f, "Cancelled: {}", reason),
            ExecError::CompilationFailed(failure) => write!(f, "Compilation failed: {}", failure),
        }
    }
}

impl std::error::Error for ExecError {}

/// Result type for guest execution
pub type ExecResult<T> = Result<T, ExecError>;

// =============================================================================
// Tests
// =============================================================================
