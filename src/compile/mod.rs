//! Compile requests and their results
//!
//! A [`CompileRequest`] is created by an [`ExecutionUnit`] that won the race
//! to compile itself, handed to the engine's
//! [`CompilationQueue`](queue::CompilationQueue), and finished exactly once
//! through [`CompileRequest::run`] or [`CompileRequest::complete`]. Finishing
//! installs the code (or records the failure) on the unit, clears the
//! unit's in-flight marker and resolves the request's [`CompileTask`].

pub mod backend;
pub mod queue;
pub mod task;

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::engine::config::EngineConfig;
use crate::frame::{ExecResult, Frame, Value};
use crate::state::CompileTier;
use crate::unit::speculation::SpeculationLog;
use crate::unit::ExecutionUnit;

pub use backend::{CompilerBackend, InterpreterBackend};
pub use queue::{BackgroundQueue, CompilationQueue, QueueError};
pub use task::{CompileOutcome, CompileTask};

// =============================================================================
// Compiled code
// =============================================================================

/// Entry point of compiled code. Runs against the caller's frame.
pub type CompiledEntry = Arc<dyn Fn(&mut Frame) -> ExecResult<Value> + Send + Sync>;

/// Installed result of a successful compilation.
///
/// Never mutated after creation; a unit swaps the whole `Arc` on
/// recompilation so activations already running old code finish on it.
pub struct CompiledCode {
    tier: CompileTier,
    code_size: usize,
    entry: CompiledEntry,
}

impl CompiledCode {
    pub fn new<F>(tier: CompileTier, code_size: usize, entry: F) -> Self
    where
        F: Fn(&mut Frame) -> ExecResult<Value> + Send + Sync + 'static,
    {
        CompiledCode {
            tier,
            code_size,
            entry: Arc::new(entry),
        }
    }

    /// Tier the code was compiled for
    pub fn tier(&self) -> CompileTier {
        self.tier
    }

    /// Backend-reported size
    pub fn code_size(&self) -> usize {
        self.code_size
    }

    #[inline]
    pub(crate) fn invoke(&self, frame: &mut Frame) -> ExecResult<Value> {
        (self.entry)(frame)
    }
}

impl fmt::Debug for CompiledCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledCode")
            .field("tier", &self.tier)
            .field("code_size", &self.code_size)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Failures
// =============================================================================

/// Why a compile request did not install code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileFailure {
    /// The backend gave up on this unit
    Bailout { reason: String, permanent: bool },

    /// The request was cancelled before it finished
    Cancelled,

    /// The unit stopped being eligible, or the queue refused the request
    Rejected(String),

    /// The backend hit an internal error
    Internal(String),
}

impl CompileFailure {
    pub fn bailout(reason: impl Into<String>, permanent: bool) -> Self {
        CompileFailure::Bailout {
            reason: reason.into(),
            permanent,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompileFailure::Cancelled)
    }
}

impl fmt::Display for CompileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileFailure::Bailout { reason, .. } => write!(f, "bailout: {}", reason),
            CompileFailure::Cancelled => write!(f, "cancelled"),
            CompileFailure::Rejected(reason) => write!(f, "rejected: {}", reason),
            CompileFailure::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for CompileFailure {}

/// Whether a failure should stop further compile attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Fall back for now; counters may trigger another attempt
    Transient,
    /// Never try again for this unit or loop instance
    Permanent,
}

impl FailureKind {
    pub fn is_permanent(self) -> bool {
        self == FailureKind::Permanent
    }
}

/// Pluggable classification of compile failures
pub trait FailurePolicy: Send + Sync {
    fn classify(&self, failure: &CompileFailure) -> FailureKind;
}

/// Bailouts decide for themselves, cancellations are transient, everything
/// else is permanent.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFailurePolicy;

impl FailurePolicy for DefaultFailurePolicy {
    fn classify(&self, failure: &CompileFailure) -> FailureKind {
        match failure {
            CompileFailure::Bailout {
                permanent: true, ..
            } => FailureKind::Permanent,
            CompileFailure::Bailout { .. } | CompileFailure::Cancelled => FailureKind::Transient,
            CompileFailure::Rejected(_) | CompileFailure::Internal(_) => FailureKind::Permanent,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// One pending compilation of one unit at one tier
pub struct CompileRequest {
    unit: Arc<ExecutionUnit>,
    tier: CompileTier,
    priority: f64,
    task: CompileTask,
}

impl CompileRequest {
    pub(crate) fn new(
        unit: Arc<ExecutionUnit>,
        tier: CompileTier,
        task: CompileTask,
        config: &EngineConfig,
    ) -> Self {
        let weight = f64::from(unit.call_and_loop_count());
        let priority = if tier == CompileTier::First && config.traversing_queue_weighting_both_tiers
        {
            weight * config.first_tier_bonus
        } else {
            weight
        };
        CompileRequest {
            unit,
            tier,
            priority,
            task,
        }
    }

    /// Unit being compiled
    pub fn unit(&self) -> &Arc<ExecutionUnit> {
        &self.unit
    }

    /// Target tier
    pub fn tier(&self) -> CompileTier {
        self.tier
    }

    /// Scheduling weight; higher runs first
    pub fn priority(&self) -> f64 {
        self.priority
    }

    /// Failed speculations of the unit, shared with every request for it
    pub fn speculation_log(&self) -> &Arc<SpeculationLog> {
        self.unit.speculation_log()
    }

    /// Task that resolves when this request finishes
    pub fn task(&self) -> &CompileTask {
        &self.task
    }

    /// Compile with the engine's backend on the current thread and finish
    pub fn run(self) {
        if self.task.is_cancelled() {
            self.complete(Err(CompileFailure::Cancelled));
            return;
        }
        trace!(unit = %self.unit.info(), tier = %self.tier, "compiling");
        let result = self.unit.engine().backend().compile(&self);
        self.complete(result);
    }

    /// Finish with an externally produced result.
    ///
    /// A successful result is discarded if the task was cancelled or the unit
    /// stopped being eligible while the compile was running.
    pub fn complete(self, result: Result<CompiledCode, CompileFailure>) {
        let result = match result {
            Ok(_) if !self.unit.is_eligible() => Err(CompileFailure::Rejected(format!(
                "{} is no longer eligible for compilation",
                self.unit.name()
            ))),
            other => other,
        };
        let outcome = self.unit.finish_compilation(self.tier, result, &self.task);
        self.task.resolve(outcome);
    }
}

impl fmt::Debug for CompileRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileRequest")
            .field("unit", self.unit.info())
            .field("tier", &self.tier)
            .field("priority", &self.priority)
            .finish()
    }
}
