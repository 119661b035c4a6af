//! Process-wide diagnostic gauges.
//!
//! All counters use `Relaxed` ordering. The allocator itself is
//! single-threaded, but several instances may live on different threads of
//! one process, so cross-counter snapshots may be transiently inconsistent.
//! This is acceptable for diagnostic display. Do NOT use these values for
//! allocation decisions.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Subtract-before-add interleavings across instances are tolerated and the
/// raw value may transiently dip below zero. Readers should always use
/// `get()`, which clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    pub const fn new() -> Self {
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
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

// Total bytes currently mapped by all tiers.
pub static TOTAL_MAPPED: Counter = Counter::new();

// Breakdown by tier.
pub static FIXED_POOL_MAPPED: Counter = Counter::new();
pub static FIXED_POOL_LIVE: Counter = Counter::new();

pub static ARENA_MAPPED: Counter = Counter::new();

pub static OS_DIRECT_MAPPED: Counter = Counter::new();
pub static OS_DIRECT_LIVE: Counter = Counter::new();
