//! Compilation queue
//!
//! The engine only relies on [`CompilationQueue::submit`]: hand over a
//! request, get its task back. [`BackgroundQueue`] is the stock
//! implementation, a rayon pool draining a priority heap.
//!
//! # Ordering
//!
//! ```text
//! traversing queue off         FIFO by submission sequence
//! traversing queue on          highest CompileRequest::priority first
//!   + first-tier priority      any first-tier job beats any last-tier job
//! ```
//!
//! Ties are broken by submission sequence (older first).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, warn};

use super::{CompileFailure, CompileRequest, CompileTask};
use crate::engine::config::EngineConfig;
use crate::state::CompileTier;

/// Submission rejected by the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue no longer accepts work
    ShutDown,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::ShutDown => write!(f, "compilation queue is shut down"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Accepts compile requests
pub trait CompilationQueue: Send + Sync {
    /// Take ownership of a request.
    ///
    /// A `synchronous` request must be finished before this returns. On
    /// error the request has been dropped unfinished and the caller is
    /// responsible for its task.
    fn submit(&self, request: CompileRequest, synchronous: bool) -> Result<CompileTask, QueueError>;

    /// Stop accepting work and cancel whatever is still queued
    fn shutdown(&self);
}

// =============================================================================
// Priority heap
// =============================================================================

struct QueuedJob {
    urgent: bool,
    priority: f64,
    sequence: u64,
    request: CompileRequest,
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedJob {}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: urgent first, then higher priority, then older sequence
        self.urgent
            .cmp(&other.urgent)
            .then_with(|| {
                self.priority
                    .partial_cmp(&other.priority)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueShared {
    heap: Mutex<BinaryHeap<QueuedJob>>,
    sequence: AtomicU64,
    shut_down: AtomicBool,
    traversing: bool,
    first_tier_priority: bool,
}

impl QueueShared {
    fn push(&self, request: CompileRequest) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        let (urgent, priority) = if self.traversing {
            (
                self.first_tier_priority && request.tier() == CompileTier::First,
                request.priority(),
            )
        } else {
            (false, 0.0)
        };
        self.heap.lock().push(QueuedJob {
            urgent,
            priority,
            sequence,
            request,
        });
    }

    fn pop(&self) -> Option<CompileRequest> {
        self.heap.lock().pop().map(|job| job.request)
    }

    fn drain(&self) -> Vec<CompileRequest> {
        self.heap.lock().drain().map(|job| job.request).collect()
    }
}

// =============================================================================
// BackgroundQueue
// =============================================================================

/// Rayon-backed queue with traversing priority
pub struct BackgroundQueue {
    shared: Arc<QueueShared>,
    pool: Option<ThreadPool>,
}

impl BackgroundQueue {
    /// Queue sized and ordered by the given configuration
    pub fn new(config: &EngineConfig) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.compiler_threads)
            .thread_name(|i| format!("tierjit-compiler-{}", i))
            .build();
        let pool = match pool {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!("failed to build compiler pool ({}), using the global rayon pool", err);
                None
            }
        };
        BackgroundQueue {
            shared: Arc::new(QueueShared {
                heap: Mutex::new(BinaryHeap::new()),
                sequence: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                traversing: config.traversing_compilation_queue,
                first_tier_priority: config.traversing_queue_first_tier_priority,
            }),
            pool,
        }
    }

    /// Jobs waiting for a worker
    pub fn pending(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(AtomicOrdering::Acquire)
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        // Each spawned job compiles whichever request is best when it runs.
        let job = move || {
            if let Some(request) = shared.pop() {
                request.run();
            }
        };
        match &self.pool {
            Some(pool) => pool.spawn(job),
            None => rayon::spawn(job),
        }
    }
}

impl CompilationQueue for BackgroundQueue {
    fn submit(&self, request: CompileRequest, synchronous: bool) -> Result<CompileTask, QueueError> {
        if self.is_shut_down() {
            return Err(QueueError::ShutDown);
        }
        let task = request.task().clone();
        if synchronous {
            request.run();
        } else {
            self.shared.push(request);
            self.spawn_worker();
        }
        Ok(task)
    }

    fn shutdown(&self) {
        if self.shared.shut_down.swap(true, AtomicOrdering::AcqRel) {
            return;
        }
        let pending = self.shared.drain();
        debug!(cancelled = pending.len(), "compilation queue shut down");
        for request in pending {
            request.task().cancel();
            request.complete(Err(CompileFailure::Cancelled));
        }
    }
}

impl fmt::Debug for BackgroundQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundQueue")
            .field("pending", &self.pending())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
