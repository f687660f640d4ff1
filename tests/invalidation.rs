//! Invalidation, deoptimisation, failure handling and observability

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::Level;

use common::*;
use tierjit::engine::listener::init_tracing;
use tierjit::engine::options::keys;
use tierjit::{
    ChannelListener, CompilationQueue, CompilationState, CompileFailure, CompileOutcome,
    CompileRequest, CompileTask, CompileTier, CompiledCode, CompilerBackend, Engine, EngineEvent,
    EngineOptions, ExecError, FailureKind, FnBody, Frame, InterpreterBackend, QueueError,
    SpeculationId, StatsSnapshot, Value,
};

const INT_ARGUMENT: SpeculationId = SpeculationId(1);

/// Backend that assumes an integer argument until that assumption fails
#[derive(Default)]
struct SpeculatingBackend {
    compiles: Arc<AtomicUsize>,
}

impl CompilerBackend for SpeculatingBackend {
    fn name(&self) -> &str {
        "speculating"
    }

    fn compile(&self, request: &CompileRequest) -> Result<CompiledCode, CompileFailure> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let tier = request.tier();
        if request.speculation_log().contains(INT_ARGUMENT) {
            return Ok(CompiledCode::new(tier, 2, |_| Ok(Value::from("generic"))));
        }
        Ok(CompiledCode::new(tier, 1, |frame| match frame.argument(0) {
            Value::Int(_) => Ok(Value::from("speculative")),
            _ => Err(ExecError::speculation_failed(INT_ARGUMENT, "argument is not an int")),
        }))
    }
}

fn labelled(name: &str) -> FnBody<impl Fn(&mut Frame) -> tierjit::ExecResult<Value> + Send + Sync> {
    FnBody::new(name, |_: &mut Frame| Ok(Value::from("interpreted")))
}

fn sync_options() -> EngineOptions {
    EngineOptions::new()
        .with(keys::COMPILE_IMMEDIATELY, true)
        .with(keys::BACKGROUND_COMPILATION, false)
}

// ============================================================================
// Deoptimisation
// ============================================================================

#[test]
fn test_failed_speculation_is_not_repeated() {
    let backend = SpeculatingBackend::default();
    let compiles = Arc::clone(&backend.compiles);
    let engine = Engine::builder(backend).options(sync_options()).build().unwrap();
    let unit = engine.create_unit(labelled("speculative"));

    assert_eq!(unit.enter([Value::Int(1)]).unwrap(), Value::from("speculative"));

    // The speculation fails: the activation re-runs interpreted.
    assert_eq!(unit.enter([Value::from("x")]).unwrap(), Value::from("interpreted"));
    assert!(!unit.is_valid());
    assert!(unit.speculation_log().contains(INT_ARGUMENT));
    assert_eq!(
        unit.speculation_log().reason(INT_ARGUMENT).as_deref(),
        Some("argument is not an int")
    );

    // Recompiled without the assumption.
    assert_eq!(unit.enter([Value::from("x")]).unwrap(), Value::from("generic"));
    assert_eq!(unit.enter([Value::Int(1)]).unwrap(), Value::from("generic"));
    assert_eq!(compiles.load(Ordering::SeqCst), 2);

    let stats = engine.stats().snapshot();
    assert_eq!(stats.deoptimizations, 1);
    assert_eq!(stats.invalidations, 1);
    assert_eq!(stats.compilations_succeeded, 2);
}

#[test]
fn test_deoptimized_root_reruns_from_original_arguments() {
    let engine = Engine::builder(InterpreterBackend).options(sync_options()).build().unwrap();
    let unit = engine.create_unit(FnBody::new("counter", |frame: &mut Frame| {
        let start = frame.argument(0).as_int().unwrap_or(0);
        if frame.state().is_compiled() && start < 0 {
            return Err(ExecError::Deoptimize {
                reason: "negative start".to_string(),
                speculation: None,
            });
        }
        Ok(Value::Int(start + 1))
    }));

    assert_eq!(unit.enter([Value::Int(1)]).unwrap(), Value::Int(2));
    assert_eq!(unit.enter([Value::Int(-5)]).unwrap(), Value::Int(-4));
    assert_eq!(engine.stats().snapshot().deoptimizations, 1);
}

#[test]
fn test_inlined_callee_sees_caller_tier() {
    let engine = Engine::builder(InterpreterBackend).options(sync_options()).build().unwrap();
    let callee = engine.create_unit(FnBody::new("callee", |frame: &mut Frame| {
        Ok(Value::Int(frame.state().tag() as i64))
    }));
    let inner = Arc::clone(&callee);
    let caller = engine.create_unit(FnBody::new("caller", move |frame: &mut Frame| {
        inner.call_inlined(frame, [])
    }));

    let tag = caller.enter([]).unwrap();
    assert_eq!(tag, Value::Int(CompilationState::Tier2Inlined.tag() as i64));
    assert_eq!(callee.call_count(), 0);
    assert!(!callee.is_valid());
}

// ============================================================================
// Failure actions
// ============================================================================

#[test]
fn test_throw_surfaces_synchronous_failure_once() {
    let backend = CountingBackend::failing(CompileFailure::bailout("unsupported node", true));
    let compiles = backend.counter();
    let engine = Engine::builder(backend)
        .options(sync_options().with(keys::COMPILATION_FAILURE_ACTION, "throw"))
        .build()
        .unwrap();
    let unit = engine.create_unit(labelled("fails"));

    let err = unit.enter([]).unwrap_err();
    assert!(matches!(
        err,
        ExecError::CompilationFailed(CompileFailure::Bailout { permanent: true, .. })
    ));
    assert!(unit.is_compilation_failed());

    // Permanently failed units just interpret.
    assert_eq!(unit.enter([]).unwrap(), Value::from("interpreted"));
    assert_eq!(compiles.load(Ordering::SeqCst), 1);
}

#[test]
fn test_silent_transient_failures_retry() {
    let backend = CountingBackend::failing(CompileFailure::bailout("busy", false));
    let compiles = backend.counter();
    let engine = Engine::builder(backend).options(sync_options()).build().unwrap();
    let unit = engine.create_unit(labelled("retries"));

    for _ in 0..3 {
        assert_eq!(unit.enter([]).unwrap(), Value::from("interpreted"));
    }
    assert_eq!(compiles.load(Ordering::SeqCst), 3);
    assert!(unit.last_compile_failed());
    assert!(!unit.is_compilation_failed());
    assert_eq!(engine.stats().snapshot().compilations_failed, 3);
}

#[test]
fn test_throw_with_background_only_prints() {
    let backend = CountingBackend::failing(CompileFailure::bailout("unsupported node", true));
    let (engine, queue) = manual_engine_with(
        backend,
        EngineOptions::new()
            .with(keys::COMPILE_IMMEDIATELY, true)
            .with(keys::COMPILATION_FAILURE_ACTION, "throw"),
    );
    let unit = engine.create_unit(labelled("quiet"));
    assert_eq!(unit.enter([]).unwrap(), Value::from("interpreted"));
    queue.run_all();
    assert!(unit.is_compilation_failed());
    assert_eq!(unit.enter([]).unwrap(), Value::from("interpreted"));
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_invalidate_cancels_pending_compile() {
    let (engine, queue) = manual_engine(EngineOptions::new().with(keys::COMPILE_IMMEDIATELY, true));
    let unit = engine.create_unit(tier_probe("pending"));
    unit.enter([]).unwrap();
    let task = unit.compile_task().unwrap();

    assert!(unit.invalidate("callee redefined", FailureKind::Transient));
    assert!(task.is_cancelled());
    // The slot is held until the queue finishes the request.
    assert!(unit.is_submitted());

    queue.run_all();
    assert_eq!(task.outcome(), Some(CompileOutcome::Failed(CompileFailure::Cancelled)));
    assert!(!unit.is_submitted());
    assert!(!unit.is_valid());
    assert!(!unit.is_compilation_failed());

    // The next entry triggers again.
    unit.enter([]).unwrap();
    assert_eq!(queue.submissions(), 2);
    queue.run_all();
    assert_eq!(unit.enter([]).unwrap(), Value::Int(2));
}

#[test]
fn test_cancelled_result_is_discarded() {
    let (engine, queue) = manual_engine(EngineOptions::new().with(keys::COMPILE_IMMEDIATELY, true));
    let unit = engine.create_unit(tier_probe("late"));
    unit.enter([]).unwrap();

    let request = queue.take().unwrap();
    let task = request.task().clone();
    assert!(task.cancel());

    // A backend that finishes after the cancel still loses.
    request.complete(Ok(CompiledCode::new(CompileTier::Last, 1, |_| Ok(Value::Nil))));
    assert_eq!(task.outcome(), Some(CompileOutcome::Failed(CompileFailure::Cancelled)));
    assert!(!unit.is_valid());
    assert!(!task.cancel());
}

/// Queue whose unit is invalidated after the backend returns but before the
/// result is installed
struct InvalidateBeforeInstall;

impl CompilationQueue for InvalidateBeforeInstall {
    fn submit(&self, request: CompileRequest, _synchronous: bool) -> Result<CompileTask, QueueError> {
        let task = request.task().clone();
        let result = InterpreterBackend.compile(&request);
        assert!(result.is_ok());
        assert!(request.unit().invalidate("callee redefined", FailureKind::Transient));
        request.complete(result);
        Ok(task)
    }

    fn shutdown(&self) {}
}

#[test]
fn test_invalidation_before_install_discards_code() {
    let engine = Engine::builder(InterpreterBackend)
        .options(EngineOptions::new().with(keys::COMPILE_IMMEDIATELY, true))
        .queue(Arc::new(InvalidateBeforeInstall))
        .build()
        .unwrap();
    let unit = engine.create_unit(tier_probe("rewritten"));

    assert_eq!(unit.enter([]).unwrap(), Value::Int(0));
    assert!(!unit.is_valid());
    assert!(!unit.is_submitted());
    assert!(!unit.is_compilation_failed());

    let stats = engine.stats().snapshot();
    assert_eq!(stats.invalidations, 1);
    assert_eq!(stats.compilations_succeeded, 0);
    assert_eq!(stats.compilations_cancelled, 1);
}

#[test]
fn test_invalidate_without_code_is_noop() {
    let (engine, _queue) = manual_engine(EngineOptions::new());
    let unit = engine.create_unit(tier_probe("idle"));
    assert!(!unit.invalidate("nothing to drop", FailureKind::Transient));
    assert_eq!(engine.stats().snapshot().invalidations, 0);
}

// ============================================================================
// Observability
// ============================================================================

#[test]
fn test_listener_sees_compile_lifecycle() {
    let (listener, events) = ChannelListener::new();
    let queue = ManualQueue::new();
    let engine = Engine::builder(InterpreterBackend)
        .options(EngineOptions::new().with(keys::COMPILE_IMMEDIATELY, true))
        .queue(queue.clone())
        .listener(listener)
        .build()
        .unwrap();
    let unit = engine.create_unit(tier_probe("watched"));

    unit.enter([]).unwrap();
    queue.run_all();
    unit.invalidate("node replaced", FailureKind::Permanent);

    let events: Vec<EngineEvent> = events.try_iter().collect();
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|event| event.unit().id == unit.id()));
    assert!(matches!(
        &events[0],
        EngineEvent::CompilationQueued { tier: CompileTier::Last, priority, .. } if *priority == 1.0
    ));
    assert!(matches!(
        &events[1],
        EngineEvent::CompilationSucceeded { tier: CompileTier::Last, code_size: 1, .. }
    ));
    assert!(matches!(
        &events[2],
        EngineEvent::Invalidated { permanent: true, reason, .. } if reason == "node replaced"
    ));
}

#[test]
fn test_closure_listener_counts_failures() {
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    let engine = Engine::builder(CountingBackend::failing(CompileFailure::Internal("oom".into())))
        .options(sync_options())
        .build()
        .unwrap();
    engine.add_listener(Arc::new(move |event: &EngineEvent| {
        if let EngineEvent::CompilationFailed { permanent, .. } = event {
            assert!(*permanent);
            seen.fetch_add(1, Ordering::SeqCst);
        }
    }));

    let unit = engine.create_unit(labelled("broken"));
    for _ in 0..3 {
        unit.enter([]).unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[test]
fn test_listener_can_register_listeners() {
    let (engine, queue) = manual_engine(EngineOptions::new().with(keys::COMPILE_IMMEDIATELY, true));
    let late_events = Arc::new(AtomicUsize::new(0));
    let registered = AtomicBool::new(false);
    let weak = Arc::downgrade(&engine);
    let counter = Arc::clone(&late_events);
    engine.add_listener(Arc::new(move |_: &EngineEvent| {
        if registered.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = weak.upgrade() {
            let counter = Arc::clone(&counter);
            engine.add_listener(Arc::new(move |_: &EngineEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
    }));

    let unit = engine.create_unit(tier_probe("chained"));
    unit.enter([]).unwrap();
    // Registered while the queued event was being delivered; sees only later ones.
    assert_eq!(late_events.load(Ordering::SeqCst), 0);

    queue.run_all();
    assert_eq!(late_events.load(Ordering::SeqCst), 1);
}

#[test]
fn test_stats_track_calls_and_reset() {
    let (engine, queue) = manual_engine(
        EngineOptions::new().with(keys::FIRST_TIER_COMPILATION_THRESHOLD, 2i64),
    );
    let unit = engine.create_unit(tier_probe("counted"));
    unit.enter([]).unwrap();
    unit.enter([]).unwrap();
    queue.run_all();
    unit.enter([]).unwrap();

    let stats = engine.stats().snapshot();
    assert_eq!(stats.units_created, 1);
    assert_eq!(stats.interpreted_calls, 2);
    assert_eq!(stats.compiled_calls, 1);
    assert_eq!(stats.tier1_compilations_queued, 1);
    assert_eq!(stats.compilations_queued(), 1);
    assert_eq!(stats.compilations_succeeded, 1);

    engine.stats().reset();
    assert_eq!(engine.stats().snapshot(), StatsSnapshot::default());
}

#[test]
fn test_aot_on_create_compiles_before_first_call() {
    let engine = Engine::builder(InterpreterBackend)
        .options(EngineOptions::new().with(keys::COMPILE_AOT_ON_CREATE, true))
        .build()
        .unwrap();
    let unit = engine.create_unit(tier_probe("ahead"));
    assert!(unit.is_valid_last_tier());
    assert_eq!(unit.enter([]).unwrap(), Value::Int(2));
    assert_eq!(unit.call_count(), 0);
}

#[test]
fn test_trace_compilation_renders_events() {
    init_tracing(Level::DEBUG);
    let engine = Engine::builder(InterpreterBackend)
        .options(sync_options().with(keys::TRACE_COMPILATION, true))
        .build()
        .unwrap();
    assert!(engine.config().trace_compilation);

    let unit = engine.create_unit(tier_probe("traced"));
    assert_eq!(unit.enter([]).unwrap(), Value::Int(2));
    unit.invalidate("traced rewrite", FailureKind::Transient);
    assert_eq!(engine.stats().snapshot().invalidations, 1);
}
