//! Compilation events and listeners
//!
//! Every submission, completion, invalidation and OSR transfer is reported
//! to the engine's listeners as an [`EngineEvent`]. Listeners run on the
//! thread that produced the event (an interpreter thread or a compiler
//! worker) and must not block.

use std::fmt;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn, Level};

use crate::compile::CompileFailure;
use crate::state::CompileTier;
use crate::unit::UnitInfo;

/// Observable engine event
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A compile request was handed to the queue
    CompilationQueued {
        unit: UnitInfo,
        tier: CompileTier,
        priority: f64,
    },

    /// Compiled code was installed
    CompilationSucceeded {
        unit: UnitInfo,
        tier: CompileTier,
        code_size: usize,
    },

    /// A compile request finished without installing code
    CompilationFailed {
        unit: UnitInfo,
        tier: CompileTier,
        failure: CompileFailure,
        permanent: bool,
    },

    /// A unit or OSR unit dropped its compiled code
    Invalidated {
        unit: UnitInfo,
        reason: String,
        permanent: bool,
    },

    /// An interpreted loop transferred into compiled OSR code
    OsrTransfer { unit: UnitInfo },
}

impl EngineEvent {
    /// Unit the event is about
    pub fn unit(&self) -> &UnitInfo {
        match self {
            EngineEvent::CompilationQueued { unit, .. }
            | EngineEvent::CompilationSucceeded { unit, .. }
            | EngineEvent::CompilationFailed { unit, .. }
            | EngineEvent::Invalidated { unit, .. }
            | EngineEvent::OsrTransfer { unit } => unit,
        }
    }
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineEvent::CompilationQueued { unit, tier, priority } => {
                write!(f, "queued {} at {} (priority {:.1})", unit, tier, priority)
            }
            EngineEvent::CompilationSucceeded {
                unit,
                tier,
                code_size,
            } => write!(f, "installed {} at {} ({} bytes)", unit, tier, code_size),
            EngineEvent::CompilationFailed {
                unit,
                tier,
                failure,
                permanent,
            } => write!(
                f,
                "failed {} at {}: {}{}",
                unit,
                tier,
                failure,
                if *permanent { " (permanent)" } else { "" }
            ),
            EngineEvent::Invalidated {
                unit,
                reason,
                permanent,
            } => write!(
                f,
                "invalidated {}: {}{}",
                unit,
                reason,
                if *permanent { " (permanent)" } else { "" }
            ),
            EngineEvent::OsrTransfer { unit } => write!(f, "osr transfer into {}", unit),
        }
    }
}

/// Receiver of engine events
pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

impl<F> EngineListener for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Renders events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl EngineListener for TracingListener {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::CompilationFailed { .. } => warn!(target: "tierjit::compilation", "{}", event),
            _ => debug!(target: "tierjit::compilation", "{}", event),
        }
    }
}

/// Forwards events over a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: Sender<EngineEvent>,
}

impl ChannelListener {
    /// Listener plus the receiving end of its channel
    pub fn new() -> (Self, Receiver<EngineEvent>) {
        let (sender, receiver) = unbounded();
        (ChannelListener { sender }, receiver)
    }
}

impl EngineListener for ChannelListener {
    fn on_event(&self, event: &EngineEvent) {
        // Receiver gone: nobody is collecting any more.
        let _ = self.sender.send(event.clone());
    }
}

/// Install a fmt subscriber at the given level. No-op if one is already set.
pub fn init_tracing(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}
