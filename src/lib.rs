//! tierjit - Tiered Compilation Trigger and On-Stack Replacement
//!
//! This library decides, per compilable unit of guest code, when interpreted
//! execution should be promoted to compiled execution across two tiers, and
//! how a loop already running in the interpreter switches to compiled code
//! without restarting.
//!
//! # Architecture
//!
//! 1. **States** (`state` module)
//!    - Closed `CompilationState` enum: interpreted, tier-1/tier-2 root,
//!      tier-1/tier-2 inlined
//!    - Tier, root and compiled queries
//!
//! 2. **Engine** (`engine` module)
//!    - `EngineOptions` snapshot and derived `EngineConfig`
//!    - Compile-only include/exclude filter
//!    - Listeners, statistics and the cooperative safepoint
//!
//! 3. **Compilation** (`compile` module)
//!    - `CompileRequest`, `CompileTask` future, failure taxonomy and policy
//!    - `CompilationQueue` contract with a rayon-backed priority queue
//!    - `CompilerBackend` contract with an interpreter-backed reference backend
//!
//! 4. **Units** (`unit` module)
//!    - Call and call+loop counting, threshold checks
//!    - At most one in-flight compile per unit
//!    - Installation, invalidation, deoptimisation, speculation log
//!
//! 5. **On-stack replacement** (`osr` module)
//!    - Profiling / compiling / direct branches driven by a trampoline
//!    - Frame transfer into compiled loop code and hand-back on deoptimisation
//!
//! # Example
//!
//! ```rust
//! use tierjit::{Engine, EngineOptions, FnBody, Frame, InterpreterBackend, Value};
//! use tierjit::engine::options::keys;
//!
//! let engine = Engine::builder(InterpreterBackend)
//!     .options(
//!         EngineOptions::new()
//!             .with(keys::FIRST_TIER_COMPILATION_THRESHOLD, 2i64)
//!             .with(keys::BACKGROUND_COMPILATION, false),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let unit = engine.create_unit(FnBody::new("tier", |frame: &mut Frame| {
//!     Ok(Value::Int(frame.tier() as i64))
//! }));
//!
//! assert_eq!(unit.enter([]).unwrap(), Value::Int(0));
//! assert_eq!(unit.enter([]).unwrap(), Value::Int(1));
//! ```

pub mod compile;
pub mod engine;
pub mod frame;
pub mod osr;
pub mod state;
pub mod unit;

pub use compile::{
    BackgroundQueue, CompilationQueue, CompileFailure, CompileOutcome, CompileRequest,
    CompileTask, CompiledCode, CompilerBackend, DefaultFailurePolicy, FailureKind, FailurePolicy,
    InterpreterBackend, QueueError,
};
pub use engine::{
    config::{CompilationFailureAction, EngineConfig},
    listener::{ChannelListener, EngineEvent, EngineListener, TracingListener},
    options::{ConfigError, ConfigResult, EngineOptions, OptionValue},
    safepoint::Safepoint,
    stats::{EngineStats, StatsSnapshot},
    Engine, EngineBuilder,
};
pub use frame::{ExecError, ExecResult, Frame, FrameInfo, LoopStatus, Value};
pub use osr::{LoopParent, OsrController};
pub use state::{CompilationState, CompileTier};
pub use unit::speculation::{SpeculationId, SpeculationLog};
pub use unit::{ExecutionUnit, FnBody, FnLoop, RepeatingBody, UnitBody, UnitId, UnitInfo, UnitKind};
