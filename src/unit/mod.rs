//! Execution units
//!
//! An [`ExecutionUnit`] is one compilable piece of guest code. It counts its
//! interpreted entries, decides when it is hot, submits at most one compile
//! request at a time and runs whatever code is currently installed.
//!
//! # Lifecycle
//!
//! ```text
//!              threshold (interpreter)             threshold (tier 1)
//! Interpreted ─────────────────────────► Tier1 ─────────────────────────► Tier2
//!      ▲                                   │                                │
//!      └────── invalidate / deoptimize ────┴────────────────────────────────┘
//! ```
//!
//! Counters survive invalidation so a unit that lost its code re-triggers
//! quickly. A permanently classified failure or node replacement marks the
//! unit as never compiling again.

pub mod body;
pub mod speculation;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::compile::{
    CompileFailure, CompileOutcome, CompileRequest, CompileTask, CompiledCode, FailureKind,
};
use crate::engine::config::{CompilationFailureAction, EngineConfig};
use crate::engine::listener::EngineEvent;
use crate::engine::Engine;
use crate::frame::{ExecError, ExecResult, Frame, Value};
use crate::state::CompileTier;

pub use body::{FnBody, FnLoop, RepeatingBody, UnitBody};
use speculation::SpeculationLog;

/// Counters saturate here instead of wrapping
pub const MAX_COUNT: u32 = i32::MAX as u32;

/// Engine-unique unit identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a unit was created for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// A function-like unit entered by the guest
    Root,
    /// A loop body compiled for on-stack replacement
    Osr,
}

/// Identity carried by events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: UnitId,
    pub name: Arc<str>,
    pub kind: UnitKind,
}

impl UnitInfo {
    pub fn new(id: UnitId, name: impl Into<Arc<str>>, kind: UnitKind) -> Self {
        UnitInfo {
            id,
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for UnitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            UnitKind::Root => write!(f, "{}#{}", self.name, self.id),
            UnitKind::Osr => write!(f, "{}<osr>#{}", self.name, self.id),
        }
    }
}

#[inline]
fn saturating_bump(counter: &AtomicU32, by: u32) -> u32 {
    // Racy load/store: a lost update under contention is acceptable.
    let next = counter.load(Ordering::Relaxed).saturating_add(by).min(MAX_COUNT);
    counter.store(next, Ordering::Relaxed);
    next
}

// =============================================================================
// ExecutionUnit
// =============================================================================

pub struct ExecutionUnit {
    info: UnitInfo,
    engine: Arc<Engine>,
    body: Arc<dyn UnitBody>,

    call_count: AtomicU32,
    call_and_loop_count: AtomicU32,

    /// Installed code; `None` means invalid
    code: RwLock<Option<Arc<CompiledCode>>>,
    /// Never compile again
    compilation_failed: AtomicBool,
    last_compile_failed: AtomicBool,
    /// In-flight request, at most one
    task: Mutex<Option<CompileTask>>,

    speculation_log: Arc<SpeculationLog>,
}

impl ExecutionUnit {
    pub(crate) fn new(engine: Arc<Engine>, body: Arc<dyn UnitBody>, info: UnitInfo) -> Self {
        ExecutionUnit {
            info,
            engine,
            body,
            call_count: AtomicU32::new(0),
            call_and_loop_count: AtomicU32::new(0),
            code: RwLock::new(None),
            compilation_failed: AtomicBool::new(false),
            last_compile_failed: AtomicBool::new(false),
            task: Mutex::new(None),
            speculation_log: Arc::new(SpeculationLog::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn id(&self) -> UnitId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> UnitKind {
        self.info.kind
    }

    pub fn info(&self) -> &UnitInfo {
        &self.info
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn body(&self) -> &Arc<dyn UnitBody> {
        &self.body
    }

    pub fn speculation_log(&self) -> &Arc<SpeculationLog> {
        &self.speculation_log
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn call_and_loop_count(&self) -> u32 {
        self.call_and_loop_count.load(Ordering::Relaxed)
    }

    /// Whether compiled code is installed
    pub fn is_valid(&self) -> bool {
        self.code.read().is_some()
    }

    /// Whether last-tier code is installed
    pub fn is_valid_last_tier(&self) -> bool {
        self.code
            .read()
            .as_ref()
            .is_some_and(|code| code.tier() == CompileTier::Last)
    }

    /// Tier of the installed code, 0 when interpreted
    pub fn current_tier(&self) -> u8 {
        self.code.read().as_ref().map_or(0, |code| code.tier().number())
    }

    pub fn is_submitted(&self) -> bool {
        self.task.lock().is_some()
    }

    /// In-flight compile task, if any
    pub fn compile_task(&self) -> Option<CompileTask> {
        self.task.lock().clone()
    }

    /// Whether the unit gave up on compilation for good
    pub fn is_compilation_failed(&self) -> bool {
        self.compilation_failed.load(Ordering::Acquire)
    }

    /// Whether the most recent compile attempt failed
    pub fn last_compile_failed(&self) -> bool {
        self.last_compile_failed.load(Ordering::Acquire)
    }

    /// Passes the engine's compile-only filter with compilation enabled
    pub fn is_eligible(&self) -> bool {
        self.engine.config().accepts_for_compilation(self.name())
    }

    pub(crate) fn installed_code(&self) -> Option<Arc<CompiledCode>> {
        self.code.read().clone()
    }

    // -------------------------------------------------------------------------
    // Entry
    // -------------------------------------------------------------------------

    /// Enter the unit with fresh arguments
    pub fn enter(self: &Arc<Self>, arguments: impl IntoIterator<Item = Value>) -> ExecResult<Value> {
        self.call(Frame::new(arguments))
    }

    /// Enter the unit with a prepared frame.
    ///
    /// Runs installed code if there is any. Otherwise counts the entry,
    /// possibly triggers a compile and interprets. A deoptimisation raised by
    /// compiled code invalidates it and re-runs the activation interpreted.
    pub fn call(self: &Arc<Self>, frame: Frame) -> ExecResult<Value> {
        let code = match self.installed_code() {
            Some(code) => Some(code),
            None => self.interpreter_call()?,
        };

        if let Some(code) = code {
            if code.tier() == CompileTier::First {
                self.first_tier_call();
            }
            match self.call_compiled(&code, &frame) {
                Err(ExecError::Deoptimize {
                    reason,
                    speculation,
                }) => self.deoptimize(&code, reason, speculation),
                other => return other,
            }
        }

        self.execute_interpreted(frame)
    }

    /// Run the body inside a compiled caller.
    ///
    /// Does not count or compile; the callee frame carries the caller's
    /// inlined state.
    pub fn call_inlined(
        &self,
        caller: &Frame,
        arguments: impl IntoIterator<Item = Value>,
    ) -> ExecResult<Value> {
        let mut frame = Frame::new(arguments);
        frame.enter_state(caller.state().inlined());
        self.body.execute(&mut frame)
    }

    /// Report loop iterations executed by this unit's interpreted loops
    pub fn report_loop_count(&self, iterations: u64) {
        let by = u32::try_from(iterations).unwrap_or(MAX_COUNT);
        saturating_bump(&self.call_and_loop_count, by);
    }

    /// Count an interpreted entry; returns installed code if a synchronous
    /// compile produced some.
    fn interpreter_call(self: &Arc<Self>) -> ExecResult<Option<Arc<CompiledCode>>> {
        let calls = saturating_bump(&self.call_count, 1);
        let calls_and_loops = saturating_bump(&self.call_and_loop_count, 1);
        self.engine.stats().record_interpreted_call();

        let config = self.engine.config();
        let hot = !self.is_compilation_failed()
            && calls >= config.call_threshold_in_interpreter
            && calls_and_loops >= config.call_and_loop_threshold_in_interpreter;
        if !hot || self.is_submitted() {
            return Ok(None);
        }
        trace!(unit = %self.info, calls, calls_and_loops, "interpreter threshold reached");

        let last_tier = !config.multi_tier;
        let synchronous = !config.background_compilation;
        if let Some(task) = self.submit_compile(last_tier, synchronous, &config) {
            if synchronous && config.effective_failure_action() == CompilationFailureAction::Throw {
                if let Some(CompileOutcome::Failed(failure)) = task.outcome() {
                    return Err(ExecError::CompilationFailed(failure));
                }
            }
        }
        Ok(self.installed_code())
    }

    /// Tier-1 code counts in its own right and escalates to the last tier
    fn first_tier_call(self: &Arc<Self>) {
        let calls = saturating_bump(&self.call_count, 1);
        let calls_and_loops = saturating_bump(&self.call_and_loop_count, 1);

        let config = self.engine.config();
        if !self.is_compilation_failed()
            && !self.is_submitted()
            && calls >= config.call_threshold_in_first_tier
            && calls_and_loops >= config.call_and_loop_threshold_in_first_tier
        {
            trace!(unit = %self.info, calls, calls_and_loops, "first-tier threshold reached");
            self.submit_compile(true, !config.background_compilation, &config);
        }
    }

    fn call_compiled(&self, code: &CompiledCode, frame: &Frame) -> ExecResult<Value> {
        self.engine.stats().record_compiled_call();
        let mut compiled = frame.clone();
        compiled.enter_state(code.tier().root_state());
        code.invoke(&mut compiled)
    }

    fn execute_interpreted(&self, mut frame: Frame) -> ExecResult<Value> {
        self.body.execute(&mut frame)
    }

    /// Run OSR code against the live loop frame.
    ///
    /// Returns [`Value::LoopContinue`] when there is nothing to run or the
    /// code deoptimised; the frame is left as the compiled code left it.
    pub(crate) fn call_osr(&self, frame: &mut Frame) -> ExecResult<Value> {
        let Some(code) = self.installed_code() else {
            return Ok(Value::LoopContinue);
        };
        self.engine.stats().record_compiled_call();
        let previous = frame.enter_state(code.tier().root_state());
        let result = code.invoke(frame);
        frame.enter_state(previous);
        match result {
            Err(ExecError::Deoptimize {
                reason,
                speculation,
            }) => {
                self.deoptimize(&code, reason, speculation);
                Ok(Value::LoopContinue)
            }
            other => other,
        }
    }

    fn deoptimize(
        &self,
        code: &Arc<CompiledCode>,
        reason: String,
        speculation: Option<speculation::SpeculationId>,
    ) {
        self.engine.stats().record_deoptimization();
        if let Some(id) = speculation {
            self.speculation_log.record(id, reason.clone());
        }
        debug!(unit = %self.info, %reason, "deoptimized");
        self.invalidate_code(Some(code), reason, FailureKind::Transient);
    }

    // -------------------------------------------------------------------------
    // Compilation
    // -------------------------------------------------------------------------

    /// Whether a compile at this tier would change anything
    fn needs_compile(&self, last_tier: bool, config: &EngineConfig) -> bool {
        !self.is_valid() || (config.multi_tier && last_tier && !self.is_valid_last_tier())
    }

    /// Request compilation now, bypassing the counters.
    ///
    /// Returns whether compiled code is installed afterwards; with background
    /// compilation this is usually false until the task completes.
    pub fn compile(self: &Arc<Self>, last_tier: bool) -> bool {
        let config = self.engine.config();
        self.submit_compile(last_tier, !config.background_compilation, &config);
        self.is_valid()
    }

    /// Submit one compile request unless one is already in flight.
    ///
    /// Returns the task when this call was the one that submitted.
    pub(crate) fn submit_compile(
        self: &Arc<Self>,
        last_tier: bool,
        synchronous: bool,
        config: &EngineConfig,
    ) -> Option<CompileTask> {
        if self.is_compilation_failed() || !self.needs_compile(last_tier, config) {
            return None;
        }
        if !config.accepts_for_compilation(self.name()) {
            trace!(unit = %self.info, "not eligible for compilation");
            return None;
        }
        let tier = if last_tier || !config.multi_tier {
            CompileTier::Last
        } else {
            CompileTier::First
        };

        let task = {
            let mut slot = self.task.lock();
            if slot.is_some() || !self.needs_compile(last_tier, config) {
                return None;
            }
            let task = CompileTask::new(tier);
            *slot = Some(task.clone());
            task
        };

        let request = CompileRequest::new(Arc::clone(self), tier, task.clone(), config);
        let priority = request.priority();
        self.engine.stats().record_queued(tier);
        self.engine.emit(EngineEvent::CompilationQueued {
            unit: self.info.clone(),
            tier,
            priority,
        });
        debug!(unit = %self.info, %tier, priority, synchronous, "compilation queued");

        if let Err(err) = self.engine.queue().submit(request, synchronous) {
            let failure = CompileFailure::Rejected(err.to_string());
            let outcome = self.finish_compilation(tier, Err(failure), &task);
            task.resolve(outcome);
        }
        Some(task)
    }

    /// Install or record the result of the in-flight request
    pub(crate) fn finish_compilation(
        &self,
        tier: CompileTier,
        result: Result<CompiledCode, CompileFailure>,
        task: &CompileTask,
    ) -> CompileOutcome {
        // Cancellation is checked under the code lock, which invalidation
        // also holds while cancelling.
        let result = result.and_then(|code| {
            let mut installed = self.code.write();
            if task.is_cancelled() {
                return Err(CompileFailure::Cancelled);
            }
            let code_size = code.code_size();
            *installed = Some(Arc::new(code));
            Ok(code_size)
        });
        let outcome = match result {
            Ok(code_size) => {
                self.last_compile_failed.store(false, Ordering::Release);
                self.engine.stats().record_succeeded();
                debug!(unit = %self.info, %tier, code_size, "compiled code installed");
                self.engine.emit(EngineEvent::CompilationSucceeded {
                    unit: self.info.clone(),
                    tier,
                    code_size,
                });
                CompileOutcome::Succeeded(tier)
            }
            Err(failure) => {
                let kind = self.engine.failure_policy().classify(&failure);
                if kind.is_permanent() {
                    self.compilation_failed.store(true, Ordering::Release);
                }
                self.last_compile_failed.store(true, Ordering::Release);
                self.engine.stats().record_failed(failure.is_cancelled());
                if self.engine.config().effective_failure_action() == CompilationFailureAction::Print {
                    warn!(unit = %self.info, %tier, "compilation failed: {}", failure);
                } else {
                    debug!(unit = %self.info, %tier, "compilation failed: {}", failure);
                }
                self.engine.emit(EngineEvent::CompilationFailed {
                    unit: self.info.clone(),
                    tier,
                    failure: failure.clone(),
                    permanent: kind.is_permanent(),
                });
                CompileOutcome::Failed(failure)
            }
        };

        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(task)) {
            *slot = None;
        }
        outcome
    }

    /// Block until the in-flight compile finishes. Returns whether code is
    /// installed afterwards.
    pub fn wait_for_compilation(&self, timeout: Option<Duration>) -> bool {
        if let Some(task) = self.compile_task() {
            match timeout {
                Some(timeout) => {
                    task.wait_timeout(timeout);
                }
                None => {
                    task.wait();
                }
            }
        }
        self.is_valid()
    }

    // -------------------------------------------------------------------------
    // Invalidation
    // -------------------------------------------------------------------------

    /// Drop installed code and cancel any in-flight compile.
    ///
    /// Counters are kept. A permanent invalidation (e.g. a node rewrite the
    /// compiler cannot handle) stops all further compilation of this unit.
    /// Returns whether anything was dropped or cancelled.
    pub fn invalidate(&self, reason: impl Into<String>, kind: FailureKind) -> bool {
        self.invalidate_code(None, reason.into(), kind)
    }

    /// Invalidate, but only the given code if `stale` is set
    fn invalidate_code(
        &self,
        stale: Option<&Arc<CompiledCode>>,
        reason: String,
        kind: FailureKind,
    ) -> bool {
        let in_flight = self.compile_task();
        let (dropped, cancelled) = {
            // Cancel under the code lock; installs check it under the same lock.
            let mut code = self.code.write();
            let matches = match (code.as_ref(), stale) {
                (Some(current), Some(stale)) => Arc::ptr_eq(current, stale),
                (Some(_), None) => true,
                (None, _) => false,
            };
            let dropped = matches && code.take().is_some();
            let cancelled = in_flight.is_some_and(|task| task.cancel());
            (dropped, cancelled)
        };
        if kind.is_permanent() {
            self.compilation_failed.store(true, Ordering::Release);
        }
        if !(dropped || cancelled || kind.is_permanent()) {
            return false;
        }

        self.engine.stats().record_invalidation();
        debug!(unit = %self.info, %reason, permanent = kind.is_permanent(), "invalidated");
        self.engine.emit(EngineEvent::Invalidated {
            unit: self.info.clone(),
            reason,
            permanent: kind.is_permanent(),
        });
        true
    }
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("info", &self.info)
            .field("call_count", &self.call_count())
            .field("call_and_loop_count", &self.call_and_loop_count())
            .field("tier", &self.current_tier())
            .field("submitted", &self.is_submitted())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
