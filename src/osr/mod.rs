//! On-stack replacement
//!
//! An [`OsrController`] sits on one guest loop. While the loop runs in the
//! interpreter it counts iterations; once the count passes the OSR threshold
//! it submits exactly one compile of the loop body as a standalone unit and,
//! when that code is ready, transfers the live frame into it without
//! restarting the loop.
//!
//! # Branches
//!
//! [`OsrController::execute`] is a trampoline. Each pass picks one branch and
//! either finishes the loop or returns `Continue` to be dispatched again:
//!
//! ```text
//! direct     enclosing frame already runs last-tier code: plain loop with
//!            a safepoint poll on every back edge
//! profiling  no OSR unit: interpret and count; on crossing the threshold
//!            submit the compile and go around the trampoline
//! compiling  OSR unit exists: pending -> one more interpreted iteration,
//!            ready -> transfer the frame, failed -> drop it and interpret
//!            the rest of this activation
//! ```

mod body;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::compile::{CompileOutcome, CompileTask, FailureKind};
use crate::engine::listener::EngineEvent;
use crate::engine::Engine;
use crate::frame::{ExecResult, Frame, LoopStatus, Value};
use crate::state::CompileTier;
use crate::unit::{ExecutionUnit, RepeatingBody, UnitInfo, UnitKind, MAX_COUNT};

use body::OsrLoopBody;

/// Where a loop reports its iterations
#[derive(Debug, Clone)]
pub enum LoopParent {
    /// Enclosing loop; iterations feed its base loop count
    Loop(Weak<OsrController>),
    /// Enclosing unit; iterations feed its call+loop counter
    Unit(Weak<ExecutionUnit>),
}

struct OsrCompilation {
    unit: Arc<ExecutionUnit>,
    task: CompileTask,
}

/// One OSR compilation per controller. `Reserved` while a thread submits
/// without holding the lock.
enum OsrSlot {
    Empty,
    Reserved,
    Submitted(OsrCompilation),
}

impl OsrSlot {
    fn submitted(&self) -> Option<&OsrCompilation> {
        match self {
            OsrSlot::Submitted(compilation) => Some(compilation),
            _ => None,
        }
    }
}

pub struct OsrController {
    info: UnitInfo,
    engine: Arc<Engine>,
    body: Arc<dyn RepeatingBody>,

    osr_threshold: AtomicU64,
    /// Iterations attributed to this loop in the current activation
    base_loop_count: AtomicU64,
    compilation: Mutex<OsrSlot>,
    /// Never resets for this instance
    compilation_disabled: AtomicBool,
    reattempts: AtomicU32,
    parent: RwLock<Option<LoopParent>>,
}

impl OsrController {
    pub(crate) fn new(engine: Arc<Engine>, body: Arc<dyn RepeatingBody>) -> Arc<Self> {
        let threshold = u64::from(engine.config().osr_compilation_threshold);
        Self::with_threshold(engine, body, threshold)
    }

    fn with_threshold(engine: Arc<Engine>, body: Arc<dyn RepeatingBody>, threshold: u64) -> Arc<Self> {
        let info = engine.next_unit_info(body.name(), UnitKind::Osr);
        Arc::new(OsrController {
            info,
            engine,
            body,
            osr_threshold: AtomicU64::new(threshold),
            base_loop_count: AtomicU64::new(0),
            compilation: Mutex::new(OsrSlot::Empty),
            compilation_disabled: AtomicBool::new(false),
            reattempts: AtomicU32::new(0),
            parent: RwLock::new(None),
        })
    }

    // -------------------------------------------------------------------------
    // Configuration and queries
    // -------------------------------------------------------------------------

    pub fn info(&self) -> &UnitInfo {
        &self.info
    }

    /// Report iterations to an enclosing unit
    pub fn attach_to_unit(&self, unit: &Arc<ExecutionUnit>) {
        *self.parent.write() = Some(LoopParent::Unit(Arc::downgrade(unit)));
    }

    /// Report iterations to an enclosing loop
    pub fn attach_to_loop(&self, parent: &Arc<OsrController>) {
        *self.parent.write() = Some(LoopParent::Loop(Arc::downgrade(parent)));
    }

    pub fn osr_threshold(&self) -> u64 {
        self.osr_threshold.load(Ordering::Relaxed)
    }

    /// Per-loop threshold override
    pub fn set_osr_threshold(&self, threshold: u64) {
        self.osr_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn base_loop_count(&self) -> u64 {
        self.base_loop_count.load(Ordering::Relaxed)
    }

    pub fn is_compilation_disabled(&self) -> bool {
        self.compilation_disabled.load(Ordering::Acquire)
    }

    /// OSR units dropped so far
    pub fn reattempts(&self) -> u32 {
        self.reattempts.load(Ordering::Relaxed)
    }

    /// Current OSR unit, if one was created
    pub fn osr_unit(&self) -> Option<Arc<ExecutionUnit>> {
        self.compilation.lock().submitted().map(|c| Arc::clone(&c.unit))
    }

    fn current_compilation(&self) -> Option<(Arc<ExecutionUnit>, CompileTask)> {
        self.compilation
            .lock()
            .submitted()
            .map(|c| (Arc::clone(&c.unit), c.task.clone()))
    }

    // -------------------------------------------------------------------------
    // Execution
    // -------------------------------------------------------------------------

    /// Run the loop to completion, returning its break value
    pub fn execute(self: &Arc<Self>, frame: &mut Frame) -> ExecResult<Value> {
        if frame.tier() >= CompileTier::Last.number() {
            return self.execute_direct(frame);
        }

        self.base_loop_count.store(0, Ordering::Relaxed);
        let mut suppressed = !self.engine.config().osr;
        loop {
            let status = if !suppressed && self.compilation.lock().submitted().is_some() {
                self.execute_compiling(frame, &mut suppressed)?
            } else {
                self.execute_profiling(frame, suppressed)?
            };
            if let LoopStatus::Break(value) = status {
                return Ok(value);
            }
        }
    }

    fn execute_direct(&self, frame: &mut Frame) -> ExecResult<Value> {
        let mut iterations = 0;
        let result = self.run_iterations(frame, None, &mut iterations);
        self.add_iterations(iterations);
        result.map(LoopStatus::into_value)
    }

    fn execute_profiling(self: &Arc<Self>, frame: &mut Frame, suppressed: bool) -> ExecResult<LoopStatus> {
        let mut iterations = 0;
        let result = self.profile(frame, suppressed, &mut iterations);
        self.add_iterations(iterations);
        result
    }

    fn profile(
        self: &Arc<Self>,
        frame: &mut Frame,
        suppressed: bool,
        iterations: &mut u64,
    ) -> ExecResult<LoopStatus> {
        let threshold = self.osr_threshold();
        loop {
            // Nested loops add to the base count mid-pass.
            if !suppressed
                && self.base_loop_count().saturating_add(*iterations) > threshold
                && !self.is_compilation_disabled()
            {
                let synchronous = !self.engine.config().background_compilation;
                if self.compile_loop(synchronous) {
                    return Ok(LoopStatus::Continue);
                }
            }
            let status = self.body.execute_repeating(frame)?;
            *iterations += 1;
            match status {
                LoopStatus::Continue => self.engine.safepoint().poll(frame)?,
                done => return Ok(done),
            }
        }
    }

    fn execute_compiling(
        self: &Arc<Self>,
        frame: &mut Frame,
        suppressed: &mut bool,
    ) -> ExecResult<LoopStatus> {
        let Some((unit, task)) = self.current_compilation() else {
            return Ok(LoopStatus::Continue);
        };

        match task.outcome() {
            None => self.interpret_once(frame),
            Some(CompileOutcome::Succeeded(_)) => {
                if !unit.is_valid() {
                    self.drop_compilation(&unit, "OSR code was invalidated".to_string(), FailureKind::Transient);
                    return Ok(LoopStatus::Continue);
                }
                self.engine.stats().record_osr_transfer();
                debug!(unit = %unit.info(), base = self.base_loop_count(), "osr transfer");
                self.engine.emit(EngineEvent::OsrTransfer {
                    unit: unit.info().clone(),
                });

                match LoopStatus::from_value(unit.call_osr(frame)?) {
                    LoopStatus::Continue if !unit.is_valid() => {
                        self.drop_compilation(
                            &unit,
                            "OSR code deoptimized".to_string(),
                            FailureKind::Transient,
                        );
                        Ok(LoopStatus::Continue)
                    }
                    LoopStatus::Continue => self.interpret_once(frame),
                    done => Ok(done),
                }
            }
            Some(CompileOutcome::Failed(failure)) => {
                let kind = self.engine.failure_policy().classify(&failure);
                self.drop_compilation(&unit, format!("OSR compilation failed: {}", failure), kind);
                *suppressed = true;
                Ok(LoopStatus::Continue)
            }
        }
    }

    fn interpret_once(&self, frame: &mut Frame) -> ExecResult<LoopStatus> {
        let mut iterations = 0;
        let result = self.run_iterations(frame, Some(1), &mut iterations);
        self.add_iterations(iterations);
        result
    }

    /// Plain loop, optionally bounded, polling on every back edge
    fn run_iterations(
        &self,
        frame: &mut Frame,
        limit: Option<u64>,
        iterations: &mut u64,
    ) -> ExecResult<LoopStatus> {
        loop {
            let status = self.body.execute_repeating(frame)?;
            *iterations += 1;
            match status {
                LoopStatus::Continue => {
                    self.engine.safepoint().poll(frame)?;
                    if limit.is_some_and(|limit| *iterations >= limit) {
                        return Ok(LoopStatus::Continue);
                    }
                }
                done => return Ok(done),
            }
        }
    }

    /// Add to the base count and report upward, saturating
    fn add_iterations(&self, iterations: u64) {
        if iterations == 0 {
            return;
        }
        let base = self.base_loop_count.load(Ordering::Relaxed);
        self.base_loop_count
            .store(base.saturating_add(iterations), Ordering::Relaxed);
        self.report_to_parent(iterations.min(u64::from(MAX_COUNT)));
    }

    fn report_to_parent(&self, iterations: u64) {
        let parent = self.parent.read().clone();
        match parent {
            Some(LoopParent::Loop(parent)) => {
                if let Some(parent) = parent.upgrade() {
                    parent.add_iterations(iterations);
                }
            }
            Some(LoopParent::Unit(unit)) => {
                if let Some(unit) = unit.upgrade() {
                    unit.report_loop_count(iterations);
                }
            }
            None => {}
        }
    }

    // -------------------------------------------------------------------------
    // Compilation
    // -------------------------------------------------------------------------

    /// Create the OSR unit and submit its compile, once.
    ///
    /// Returns whether an OSR compilation exists afterwards. A thread that
    /// finds another one mid-submission gets `false` and keeps interpreting.
    fn compile_loop(self: &Arc<Self>, synchronous: bool) -> bool {
        {
            let mut slot = self.compilation.lock();
            match *slot {
                OsrSlot::Submitted(_) => return true,
                OsrSlot::Reserved => return false,
                OsrSlot::Empty => {}
            }
            if self.is_compilation_disabled() {
                return false;
            }
            *slot = OsrSlot::Reserved;
        }

        let config = self.engine.config();
        let body = OsrLoopBody::new(
            Arc::clone(&self.info.name),
            Arc::clone(&self.body),
            Arc::clone(self.engine.safepoint()),
        );
        let info = self.engine.next_unit_info(&self.info.name, UnitKind::Osr);
        let unit = Arc::new(ExecutionUnit::new(Arc::clone(&self.engine), Arc::new(body), info));

        let Some(task) = unit.submit_compile(true, synchronous, &config) else {
            self.release_reservation();
            self.disable("OSR compilation rejected".to_string());
            return false;
        };
        self.engine.stats().record_osr_compilation();
        debug!(
            unit = %unit.info(),
            base = self.base_loop_count(),
            threshold = self.osr_threshold(),
            "osr compilation submitted"
        );

        let mut slot = self.compilation.lock();
        if matches!(*slot, OsrSlot::Reserved) {
            *slot = OsrSlot::Submitted(OsrCompilation { unit, task });
            return true;
        }
        // The loop node was replaced while the compile was being submitted.
        drop(slot);
        unit.invalidate("loop node replaced during OSR compilation", FailureKind::Transient);
        false
    }

    fn release_reservation(&self) {
        let mut slot = self.compilation.lock();
        if matches!(*slot, OsrSlot::Reserved) {
            *slot = OsrSlot::Empty;
        }
    }

    /// Compile immediately, bypassing the counters, and wait for the result.
    ///
    /// Returns whether valid OSR code is installed afterwards.
    pub fn force_osr(self: &Arc<Self>) -> bool {
        self.base_loop_count
            .store(self.osr_threshold(), Ordering::Relaxed);
        if !self.compile_loop(true) {
            return false;
        }
        match self.current_compilation() {
            Some((unit, task)) => {
                task.wait();
                unit.is_valid()
            }
            None => false,
        }
    }

    /// Forget the OSR unit after it failed or lost its code
    fn drop_compilation(&self, unit: &Arc<ExecutionUnit>, reason: String, kind: FailureKind) {
        {
            let mut slot = self.compilation.lock();
            match slot.submitted() {
                Some(current) if Arc::ptr_eq(&current.unit, unit) => *slot = OsrSlot::Empty,
                // Already dropped by another activation.
                _ => return,
            }
        }
        if !unit.invalidate(reason.clone(), kind) {
            self.notify_invalidated(unit.info().clone(), reason.clone(), kind.is_permanent());
        }

        if kind.is_permanent() {
            self.compilation_disabled.store(true, Ordering::Release);
            return;
        }
        let reattempts = self.reattempts.fetch_add(1, Ordering::Relaxed) + 1;
        let limit = self.engine.config().osr_max_compilation_reattempts;
        if reattempts > limit {
            self.disable(format!(
                "OSR compilation reattempted {} times (limit {})",
                reattempts, limit
            ));
        }
    }

    /// The loop node was rewritten.
    ///
    /// Drops any OSR unit; a permanent classification disables OSR for this
    /// controller for good.
    pub fn node_replaced(&self, reason: impl Into<String>, kind: FailureKind) {
        let reason = reason.into();
        let taken = std::mem::replace(&mut *self.compilation.lock(), OsrSlot::Empty);
        let notified = match taken {
            OsrSlot::Submitted(compilation) => compilation.unit.invalidate(reason.clone(), kind),
            OsrSlot::Empty | OsrSlot::Reserved => false,
        };
        if kind.is_permanent() {
            self.compilation_disabled.store(true, Ordering::Release);
            if !notified {
                self.notify_invalidated(self.info.clone(), reason, true);
            }
        }
    }

    /// Fresh controller for a cloned loop node: same body and threshold,
    /// counters and OSR state reset.
    pub fn clone_uninitialized(&self) -> Arc<OsrController> {
        Self::with_threshold(
            Arc::clone(&self.engine),
            Arc::clone(&self.body),
            self.osr_threshold(),
        )
    }

    fn disable(&self, reason: String) {
        if self.compilation_disabled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify_invalidated(self.info.clone(), reason, true);
    }

    fn notify_invalidated(&self, unit: UnitInfo, reason: String, permanent: bool) {
        self.engine.stats().record_invalidation();
        debug!(unit = %unit, %reason, permanent, "osr invalidated");
        self.engine.emit(EngineEvent::Invalidated {
            unit,
            reason,
            permanent,
        });
    }
}

impl fmt::Debug for OsrController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsrController")
            .field("info", &self.info)
            .field("osr_threshold", &self.osr_threshold())
            .field("base_loop_count", &self.base_loop_count())
            .field("compilation_disabled", &self.is_compilation_disabled())
            .field("reattempts", &self.reattempts())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
