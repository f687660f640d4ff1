//! Test utilities for engine integration tests
//!
//! - `ManualQueue`: records submissions and lets the test decide when (and
//!   how) each request finishes
//! - `CountingBackend` / `GatedBackend`: reference backend wrappers that
//!   count, fail or block compilations
//! - Guest bodies: tier probes and a summing loop

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use tierjit::{
    CompilationQueue, CompileFailure, CompileRequest, CompileTask, CompiledCode, CompilerBackend,
    Engine, EngineOptions, ExecResult, FnBody, FnLoop, Frame, InterpreterBackend, LoopStatus,
    QueueError, Value,
};

// ============================================================================
// Queues
// ============================================================================

/// Queue that holds every request until the test finishes it
#[derive(Default)]
pub struct ManualQueue {
    pending: Mutex<VecDeque<CompileRequest>>,
    submissions: AtomicUsize,
    shut_down: AtomicBool,
}

impl ManualQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests ever accepted
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn take(&self) -> Option<CompileRequest> {
        self.pending.lock().pop_front()
    }

    /// Compile every pending request with the engine's backend
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while let Some(request) = self.take() {
            request.run();
            ran += 1;
        }
        ran
    }

    /// Finish every pending request with the given failure
    pub fn fail_all(&self, failure: CompileFailure) -> usize {
        let mut failed = 0;
        while let Some(request) = self.take() {
            request.complete(Err(failure.clone()));
            failed += 1;
        }
        failed
    }
}

impl CompilationQueue for ManualQueue {
    fn submit(&self, request: CompileRequest, synchronous: bool) -> Result<CompileTask, QueueError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(QueueError::ShutDown);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let task = request.task().clone();
        if synchronous {
            request.run();
        } else {
            self.pending.lock().push_back(request);
        }
        Ok(task)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.fail_all(CompileFailure::Cancelled);
    }
}

/// Engine over a manual queue
pub fn manual_engine(options: EngineOptions) -> (Arc<Engine>, Arc<ManualQueue>) {
    manual_engine_with(InterpreterBackend, options)
}

pub fn manual_engine_with(
    backend: impl CompilerBackend + 'static,
    options: EngineOptions,
) -> (Arc<Engine>, Arc<ManualQueue>) {
    let queue = ManualQueue::new();
    let engine = Engine::builder(backend)
        .options(options)
        .queue(queue.clone())
        .build()
        .unwrap();
    (engine, queue)
}

// ============================================================================
// Backends
// ============================================================================

/// Reference backend that counts compilations and can be told to fail
#[derive(Clone, Default)]
pub struct CountingBackend {
    compiles: Arc<AtomicUsize>,
    failure: Option<CompileFailure>,
}

impl CountingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failure: CompileFailure) -> Self {
        CountingBackend {
            compiles: Arc::new(AtomicUsize::new(0)),
            failure: Some(failure),
        }
    }

    /// Shared counter, readable after the backend moved into an engine
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.compiles)
    }
}

impl CompilerBackend for CountingBackend {
    fn compile(&self, request: &CompileRequest) -> Result<CompiledCode, CompileFailure> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(failure) => Err(failure.clone()),
            None => InterpreterBackend.compile(request),
        }
    }
}

/// Reference backend that records the compile order and parks on the
/// unit named `gate` until released
pub struct GatedBackend {
    gate: String,
    started: Sender<()>,
    release: Receiver<()>,
    order: Arc<Mutex<Vec<String>>>,
}

pub struct Gate {
    pub started: Receiver<()>,
    pub release: Sender<()>,
    pub order: Arc<Mutex<Vec<String>>>,
}

impl GatedBackend {
    pub fn new(gate: &str) -> (Self, Gate) {
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        let order = Arc::new(Mutex::new(Vec::new()));
        let backend = GatedBackend {
            gate: gate.to_string(),
            started: started_tx,
            release: release_rx,
            order: Arc::clone(&order),
        };
        let gate = Gate {
            started: started_rx,
            release: release_tx,
            order,
        };
        (backend, gate)
    }
}

impl CompilerBackend for GatedBackend {
    fn compile(&self, request: &CompileRequest) -> Result<CompiledCode, CompileFailure> {
        let name = request.unit().name().to_string();
        self.order.lock().push(name.clone());
        if name == self.gate {
            let _ = self.started.send(());
            let _ = self.release.recv();
        }
        InterpreterBackend.compile(request)
    }
}

// ============================================================================
// Guest bodies
// ============================================================================

/// Returns the tier the activation ran at
pub fn tier_probe(name: &str) -> FnBody<impl Fn(&mut Frame) -> ExecResult<Value> + Send + Sync> {
    FnBody::new(name, |frame: &mut Frame| Ok(Value::Int(frame.tier() as i64)))
}

/// Sums 1..=n with n in argument 0; local 0 is the counter, local 1 the sum
pub fn summing_loop() -> FnLoop<impl Fn(&mut Frame) -> ExecResult<LoopStatus> + Send + Sync> {
    FnLoop::new("sum", sum_step)
}

pub fn sum_step(frame: &mut Frame) -> ExecResult<LoopStatus> {
    let n = frame.argument(0).as_int().unwrap_or(0);
    let i = frame.local_int(0);
    if i >= n {
        return Ok(LoopStatus::Break(Value::Int(frame.local_int(1))));
    }
    frame.set_local(0, Value::Int(i + 1));
    frame.set_local(1, Value::Int(frame.local_int(1) + i + 1));
    Ok(LoopStatus::Continue)
}

/// Result of summing 1..=n without any engine involvement
pub fn expected_sum(n: i64) -> Value {
    Value::Int(n * (n + 1) / 2)
}
