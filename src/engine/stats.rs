//! Engine-wide compilation statistics
//!
//! All counters are relaxed atomics updated on the hot path; a
//! [`StatsSnapshot`] is a plain copy for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::state::CompileTier;

/// Lock-free counters shared by every unit of one engine
#[derive(Debug, Default)]
pub struct EngineStats {
    units_created: AtomicU64,
    interpreted_calls: AtomicU64,
    compiled_calls: AtomicU64,
    tier1_compilations_queued: AtomicU64,
    tier2_compilations_queued: AtomicU64,
    compilations_succeeded: AtomicU64,
    compilations_failed: AtomicU64,
    compilations_cancelled: AtomicU64,
    invalidations: AtomicU64,
    deoptimizations: AtomicU64,
    osr_compilations: AtomicU64,
    osr_transfers: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Units materialised by the engine
    pub units_created: u64,

    /// Entries that ran in the interpreter
    pub interpreted_calls: u64,

    /// Entries that ran compiled code
    pub compiled_calls: u64,

    /// First-tier compile requests submitted
    pub tier1_compilations_queued: u64,

    /// Last-tier compile requests submitted
    pub tier2_compilations_queued: u64,

    /// Compilations that installed code
    pub compilations_succeeded: u64,

    /// Compilations that failed (cancellations included)
    pub compilations_failed: u64,

    /// Compilations that were cancelled
    pub compilations_cancelled: u64,

    /// Units or OSR units invalidated
    pub invalidations: u64,

    /// Deoptimisations raised by compiled code
    pub deoptimizations: u64,

    /// OSR compile requests submitted
    pub osr_compilations: u64,

    /// Transfers from an interpreted loop into compiled OSR code
    pub osr_transfers: u64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_unit_created(&self) {
        self.units_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_interpreted_call(&self) {
        self.interpreted_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compiled_call(&self) {
        self.compiled_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued(&self, tier: CompileTier) {
        match tier {
            CompileTier::First => self.tier1_compilations_queued.fetch_add(1, Ordering::Relaxed),
            CompileTier::Last => self.tier2_compilations_queued.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub(crate) fn record_succeeded(&self) {
        self.compilations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, cancelled: bool) {
        self.compilations_failed.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.compilations_cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deoptimization(&self) {
        self.deoptimizations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_osr_compilation(&self) {
        self.osr_compilations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_osr_transfer(&self) {
        self.osr_transfers.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            units_created: self.units_created.load(Ordering::Relaxed),
            interpreted_calls: self.interpreted_calls.load(Ordering::Relaxed),
            compiled_calls: self.compiled_calls.load(Ordering::Relaxed),
            tier1_compilations_queued: self.tier1_compilations_queued.load(Ordering::Relaxed),
            tier2_compilations_queued: self.tier2_compilations_queued.load(Ordering::Relaxed),
            compilations_succeeded: self.compilations_succeeded.load(Ordering::Relaxed),
            compilations_failed: self.compilations_failed.load(Ordering::Relaxed),
            compilations_cancelled: self.compilations_cancelled.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            deoptimizations: self.deoptimizations.load(Ordering::Relaxed),
            osr_compilations: self.osr_compilations.load(Ordering::Relaxed),
            osr_transfers: self.osr_transfers.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics (lock-free via atomic stores)
    pub fn reset(&self) {
        for counter in [
            &self.units_created,
            &self.interpreted_calls,
            &self.compiled_calls,
            &self.tier1_compilations_queued,
            &self.tier2_compilations_queued,
            &self.compilations_succeeded,
            &self.compilations_failed,
            &self.compilations_cancelled,
            &self.invalidations,
            &self.deoptimizations,
            &self.osr_compilations,
            &self.osr_transfers,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StatsSnapshot {
    /// Total compile requests submitted across both tiers
    pub fn compilations_queued(&self) -> u64 {
        self.tier1_compilations_queued + self.tier2_compilations_queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_reset() {
        let stats = EngineStats::new();
        stats.record_queued(CompileTier::First);
        stats.record_queued(CompileTier::Last);
        stats.record_failed(true);
        stats.record_osr_transfer();

        let snap = stats.snapshot();
        assert_eq!(snap.compilations_queued(), 2);
        assert_eq!(snap.compilations_failed, 1);
        assert_eq!(snap.compilations_cancelled, 1);
        assert_eq!(snap.osr_transfers, 1);

        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
