//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent and cross-counter snapshots may transiently
//! disagree. This is acceptable for diagnostic display. Do NOT use these
//! values for allocation decisions.
//!
//! Gauges are updated only when a block is acquired from or released to the
//! user allocator, never per chunk: the pool itself is a single-mutator
//! structure and its hot path stays atomic-free.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `load()`/`get()`, which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Total bytes currently acquired from user allocators across every pool.
crate::sync::static_atomic! {
    pub static BYTES_ACQUIRED: Counter = Counter::new();
}
// Blocks currently held by pools (not yet released or purged).
crate::sync::static_atomic! {
    pub static BLOCKS_LIVE: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic counter.
///
/// A single atomic subtraction (no load-then-subtract race); readers clamp
/// negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time view of the crate-wide gauges.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub bytes_acquired: usize,
    pub blocks_live: usize,
}

/// Snapshot the crate-wide gauges.
#[must_use]
pub fn snapshot() -> PoolStats {
    PoolStats {
        bytes_acquired: BYTES_ACQUIRED.load(Ordering::Relaxed),
        blocks_live: BLOCKS_LIVE.load(Ordering::Relaxed),
    }
}
