//! Failed-speculation log
//!
//! Append-only record of assumptions that failed at runtime. One log per
//! unit, shared by `Arc` with every compile request for that unit, so a
//! backend can refuse to make the same assumption twice.

use std::fmt;

use dashmap::DashMap;

/// Identity of one speculative assumption in compiled code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpeculationId(pub u64);

impl fmt::Display for SpeculationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "speculation#{}", self.0)
    }
}

#[derive(Debug, Default)]
pub struct SpeculationLog {
    failed: DashMap<SpeculationId, String>,
}

impl SpeculationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed speculation. Returns true the first time an id is seen;
    /// the first reason is kept.
    pub fn record(&self, id: SpeculationId, reason: impl Into<String>) -> bool {
        let mut inserted = false;
        self.failed.entry(id).or_insert_with(|| {
            inserted = true;
            reason.into()
        });
        inserted
    }

    /// Whether this assumption already failed
    pub fn contains(&self, id: SpeculationId) -> bool {
        self.failed.contains_key(&id)
    }

    /// Reason recorded for a failed assumption
    pub fn reason(&self, id: SpeculationId) -> Option<String> {
        self.failed.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failed.is_empty()
    }
}
