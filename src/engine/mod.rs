//! Engine
//!
//! An [`Engine`] owns everything its units share: the current
//! configuration snapshot, the compiler backend, the compilation queue, the
//! failure policy, listeners, the safepoint and statistics.
//!
//! ```ignore
//! let engine = Engine::builder(InterpreterBackend)
//!     .options(EngineOptions::new().with(keys::FIRST_TIER_COMPILATION_THRESHOLD, 5i64))
//!     .build()?;
//! let unit = engine.create_unit(FnBody::new("answer", |_| Ok(Value::Int(42))));
//! unit.enter([])?;
//! ```

pub mod config;
pub mod filter;
pub mod listener;
pub mod options;
pub mod safepoint;
pub mod stats;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::compile::{
    BackgroundQueue, CompilationQueue, CompilerBackend, DefaultFailurePolicy, FailurePolicy,
};
use crate::osr::OsrController;
use crate::unit::{ExecutionUnit, RepeatingBody, UnitBody, UnitId, UnitInfo, UnitKind};

use config::EngineConfig;
use listener::{EngineEvent, EngineListener, TracingListener};
use options::{ConfigResult, EngineOptions};
use safepoint::Safepoint;
use stats::EngineStats;

pub struct Engine {
    config: RwLock<Arc<EngineConfig>>,
    backend: Arc<dyn CompilerBackend>,
    queue: Arc<dyn CompilationQueue>,
    failure_policy: Arc<dyn FailurePolicy>,
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
    safepoint: Arc<Safepoint>,
    stats: EngineStats,
    next_unit_id: AtomicU64,
}

impl Engine {
    /// Start building an engine around a compiler backend
    pub fn builder(backend: impl CompilerBackend + 'static) -> EngineBuilder {
        EngineBuilder::new(Arc::new(backend))
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config.read())
    }

    /// Replace the configuration.
    ///
    /// Units pick the new snapshot up at their next threshold check; code
    /// already running keeps the snapshot it started with. The queue keeps
    /// the ordering it was built with.
    pub fn reconfigure(&self, options: &EngineOptions) -> ConfigResult<()> {
        let config = Arc::new(EngineConfig::load(options)?);
        *self.config.write() = config;
        debug!("engine reconfigured");
        Ok(())
    }

    pub fn backend(&self) -> &dyn CompilerBackend {
        self.backend.as_ref()
    }

    pub fn queue(&self) -> &dyn CompilationQueue {
        self.queue.as_ref()
    }

    pub fn failure_policy(&self) -> &dyn FailurePolicy {
        self.failure_policy.as_ref()
    }

    pub fn safepoint(&self) -> &Arc<Safepoint> {
        &self.safepoint
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn add_listener(&self, listener: Arc<dyn EngineListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if self.config.read().trace_compilation {
            TracingListener.on_event(&event);
        }
        // Listeners may register further listeners.
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_event(&event);
        }
    }

    pub(crate) fn next_unit_info(&self, name: &str, kind: UnitKind) -> UnitInfo {
        let id = UnitId(self.next_unit_id.fetch_add(1, Ordering::Relaxed));
        UnitInfo::new(id, name, kind)
    }

    /// Materialise a unit for guest code
    pub fn create_unit(self: &Arc<Self>, body: impl UnitBody + 'static) -> Arc<ExecutionUnit> {
        self.create_shared_unit(Arc::new(body))
    }

    /// Materialise a unit for a body that is already shared
    pub fn create_shared_unit(self: &Arc<Self>, body: Arc<dyn UnitBody>) -> Arc<ExecutionUnit> {
        let info = self.next_unit_info(body.name(), UnitKind::Root);
        let unit = Arc::new(ExecutionUnit::new(Arc::clone(self), body, info));
        self.stats.record_unit_created();

        let config = self.config();
        if config.compile_aot_on_create {
            unit.submit_compile(true, true, &config);
        }
        unit
    }

    /// Create an OSR controller for a loop
    pub fn create_loop(self: &Arc<Self>, body: impl RepeatingBody + 'static) -> Arc<OsrController> {
        OsrController::new(Arc::clone(self), Arc::new(body))
    }

    /// Stop the queue; queued compilations resolve as cancelled
    pub fn shutdown(&self) {
        debug!("engine shutting down");
        self.queue.shutdown();
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("backend", &self.backend.name())
            .field("listeners", &self.listeners.read().len())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// EngineBuilder
// =============================================================================

pub struct EngineBuilder {
    backend: Arc<dyn CompilerBackend>,
    options: EngineOptions,
    queue: Option<Arc<dyn CompilationQueue>>,
    failure_policy: Arc<dyn FailurePolicy>,
    listeners: Vec<Arc<dyn EngineListener>>,
}

impl EngineBuilder {
    fn new(backend: Arc<dyn CompilerBackend>) -> Self {
        EngineBuilder {
            backend,
            options: EngineOptions::new(),
            queue: None,
            failure_policy: Arc::new(DefaultFailurePolicy),
            listeners: Vec::new(),
        }
    }

    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Use a custom queue instead of a [`BackgroundQueue`]
    pub fn queue(mut self, queue: Arc<dyn CompilationQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Arc::new(policy);
        self
    }

    pub fn listener(mut self, listener: impl EngineListener + 'static) -> Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn build(self) -> ConfigResult<Arc<Engine>> {
        let config = EngineConfig::load(&self.options)?;
        let queue = match self.queue {
            Some(queue) => queue,
            None => Arc::new(BackgroundQueue::new(&config)),
        };
        debug!(
            backend = self.backend.name(),
            multi_tier = config.multi_tier,
            background = config.background_compilation,
            "engine created"
        );
        Ok(Arc::new(Engine {
            config: RwLock::new(Arc::new(config)),
            backend: self.backend,
            queue,
            failure_policy: self.failure_policy,
            listeners: RwLock::new(self.listeners),
            safepoint: Arc::new(Safepoint::new()),
            stats: EngineStats::new(),
            next_unit_id: AtomicU64::new(1),
        }))
    }
}
