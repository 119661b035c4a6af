use super::coalesce::CoalesceArena;
use super::fixed_pool::FixedPool;
use super::large_direct::LargeDirect;
use super::pages::{PageError, PageSource, SystemPages};
use super::stats;
use super::ALIGNMENT;
use std::ptr::NonNull;

/// Size classes served by dedicated fixed pools, ascending.
pub const CLASS_SIZES: [usize; NUM_CLASSES] = [16, 32, 64, 128, 256, 512];
pub const NUM_CLASSES: usize = 6;
/// Blocks per fixed pool.
pub const BLOCKS_PER_POOL: usize = 1024;
/// Requests above this go straight to the page source.
pub const OS_THRESHOLD: usize = 10 * 1024 * 1024;
/// Coalesce arena size; the arena never grows past it.
pub const ARENA_INITIAL_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for [`TieredAllocator`]. All fields have sensible
/// defaults. Set at construction time via `TieredAllocator::with_config()`.
#[derive(Clone, Debug)]
pub struct TieredAllocatorConfig {
    /// Blocks per size-class pool. Default: 1024.
    pub blocks_per_pool: usize,

    /// Coalesce arena size in bytes. Default: 4 MiB.
    pub arena_size: usize,

    /// Threshold above which requests map pages directly. Default: 10 MiB.
    pub os_threshold: usize,
}

impl Default for TieredAllocatorConfig {
    fn default() -> Self {
        Self {
            blocks_per_pool: BLOCKS_PER_POOL,
            arena_size: ARENA_INITIAL_SIZE,
            os_threshold: OS_THRESHOLD,
        }
    }
}

/// Process-wide gauge snapshot, in bytes (and live-block counts for the
/// per-allocation tiers). Aggregated over every allocator instance in the
/// process.
pub struct TieredStats {
    pub total_mapped: usize,
    pub fixed_pool_mapped: usize,
    pub fixed_pool_live: usize,
    pub arena_mapped: usize,
    pub os_direct_mapped: usize,
    pub os_direct_live: usize,
}

/// Façade over the three allocation tiers.
///
/// `alloc` routes by rounded size: size classes to the fixed pools (falling
/// through to the arena on exhaustion), mid-range to the coalesce arena,
/// and everything above the threshold straight to the page source. `free`
/// identifies the owning tier by address alone, which works because the
/// tiers allocate from disjoint mappings.
///
/// Lifecycle is `fresh -> initialized -> destroyed` (terminal); every
/// public operation debug-asserts its place in that order.
pub struct TieredAllocator {
    pools: [FixedPool; NUM_CLASSES],
    arena: CoalesceArena,
    direct: LargeDirect,
    arena_size: usize,
    os_threshold: usize,
    initialized: bool,
    destroyed: bool,
}

impl Default for TieredAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TieredAllocator {
    /// Construct with the default tier configuration. No memory is mapped
    /// until [`TieredAllocator::init`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&TieredAllocatorConfig::default())
    }

    /// Construct with an explicit configuration.
    ///
    /// # Panics
    ///
    /// Panics if `blocks_per_pool` is zero.
    #[must_use]
    pub fn with_config(config: &TieredAllocatorConfig) -> Self {
        Self {
            pools: CLASS_SIZES.map(|size| FixedPool::new(size, config.blocks_per_pool)),
            arena: CoalesceArena::new(),
            direct: LargeDirect::new(),
            arena_size: config.arena_size,
            os_threshold: config.os_threshold,
            initialized: false,
            destroyed: false,
        }
    }

    /// Initialize every pool and the arena.
    ///
    /// # Errors
    ///
    /// Returns `PageError` if any backing mapping fails. Tiers initialized
    /// before the failure stay mapped and are reclaimed on drop.
    pub fn init(&mut self) -> Result<(), PageError> {
        debug_assert!(!self.initialized, "allocator already initialized");
        debug_assert!(!self.destroyed, "allocator was destroyed");

        for pool in &mut self.pools {
            pool.init()?;
        }
        self.arena.init(self.arena_size)?;

        self.initialized = true;
        Ok(())
    }

    /// Release every outstanding direct mapping, the arena, and every pool.
    /// The allocator is terminal afterwards.
    pub fn destroy(&mut self) {
        debug_assert!(self.initialized, "allocator not initialized");
        debug_assert!(!self.destroyed, "allocator already destroyed");

        self.direct.release_all();
        self.arena.destroy();
        for pool in &mut self.pools {
            pool.destroy();
        }

        self.destroyed = true;
        self.initialized = false;
    }

    /// Allocate `size` bytes, 8-byte aligned. Returns `None` for zero-size
    /// requests and on exhaustion of the selected tier.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        debug_assert!(self.initialized, "allocator not initialized");
        debug_assert!(!self.destroyed, "allocator was destroyed");

        if size == 0 {
            return None;
        }
        let aligned = size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);

        if aligned > self.os_threshold {
            return self.direct.alloc(aligned);
        }

        // Smallest class that fits; on pool exhaustion the request falls
        // through to the arena rather than a larger class.
        if let Some(pool) = self.pools.iter_mut().find(|p| aligned <= p.block_size()) {
            if let Some(ptr) = pool.alloc() {
                return Some(ptr);
            }
        }

        // The arena is the last resort; a `None` here is final (no OS
        // spill below the threshold).
        self.arena.alloc(aligned)
    }

    /// Return `ptr` to its owning tier. Null is a no-op.
    ///
    /// # Safety
    /// `ptr` must be null or a pointer previously returned by
    /// `Self::alloc` on this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        debug_assert!(self.initialized, "allocator not initialized");
        debug_assert!(!self.destroyed, "allocator was destroyed");

        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };

        if self.direct.owns(ptr.as_ptr()) {
            // Safety: ownership established by the record table.
            unsafe { self.direct.free(ptr) };
            return;
        }

        if let Some(pool) = self.pools.iter_mut().find(|p| p.belongs(ptr.as_ptr())) {
            // Safety: the pool claimed the address.
            unsafe { pool.free(ptr) };
            return;
        }

        // The arena validates internally and ignores pointers it does not
        // recognize.
        // Safety: per contract ptr is either an arena block or unknown.
        unsafe { self.arena.free(ptr) };
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// The size-class pools, ascending by block size.
    #[must_use]
    pub fn pools(&self) -> &[FixedPool] {
        &self.pools
    }

    /// The coalesce arena tier.
    #[must_use]
    pub fn arena(&self) -> &CoalesceArena {
        &self.arena
    }

    /// The direct-mapping tier.
    #[must_use]
    pub fn direct(&self) -> &LargeDirect {
        &self.direct
    }

    /// Snapshot of the process-wide gauges.
    #[must_use]
    pub fn stats(&self) -> TieredStats {
        TieredStats {
            total_mapped: stats::TOTAL_MAPPED.get(),
            fixed_pool_mapped: stats::FIXED_POOL_MAPPED.get(),
            fixed_pool_live: stats::FIXED_POOL_LIVE.get(),
            arena_mapped: stats::ARENA_MAPPED.get(),
            os_direct_mapped: stats::OS_DIRECT_MAPPED.get(),
            os_direct_live: stats::OS_DIRECT_LIVE.get(),
        }
    }

    /// Per-tier occupancy summary.
    pub fn dump_stat(&self) {
        println!();
        println!("=== tiered allocator statistics ===");
        println!();
        println!("fixed pools:");
        for pool in &self.pools {
            print!("  {} bytes: ", pool.block_size());
            pool.dump_stat();
        }
        println!();
        println!("coalesce arena:");
        self.arena.dump_stat();
        println!();
        println!("direct OS allocations:");
        self.direct.dump_stat();
        println!();
        println!("summary:");
        println!("  class sizes: {CLASS_SIZES:?}");
        println!("  OS threshold: {} bytes", self.os_threshold);
        println!("  page size: {} bytes", SystemPages::page_size());
        println!("===================================");
    }

    /// Per-tier block dumps.
    pub fn dump_blocks(&self) {
        println!();
        println!("=== tiered allocator blocks ===");
        for pool in &self.pools {
            println!();
            println!("{}-byte blocks:", pool.block_size());
            pool.dump_blocks();
        }
        println!();
        self.arena.dump_blocks();
        println!();
        self.direct.dump_blocks();
        println!("===============================");
    }
}

impl Drop for TieredAllocator {
    fn drop(&mut self) {
        debug_assert!(
            self.destroyed || !self.initialized,
            "TieredAllocator dropped without destroy()"
        );
        // Member drops release any remaining mappings either way.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_alloc_and_null_free_are_noops() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        assert!(alloc.alloc(0).is_none());
        // Safety: null is a documented no-op.
        unsafe { alloc.free(std::ptr::null_mut()) };

        alloc.destroy();
    }

    #[test]
    fn test_small_requests_route_to_matching_pool() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        // Each request lands in the smallest class that fits its rounded
        // size.
        let cases = [(10usize, 16usize), (16, 16), (17, 32), (100, 128), (512, 512)];
        for (request, class) in cases {
            let p = alloc.alloc(request).expect("pool alloc failed");
            assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
            let pool = alloc
                .pools()
                .iter()
                .find(|pool| pool.belongs(p.as_ptr()))
                .expect("pointer not owned by any pool");
            assert_eq!(pool.block_size(), class, "request of {request} bytes");
            // Safety: p is live.
            unsafe { alloc.free(p.as_ptr()) };
        }

        alloc.destroy();
    }

    #[test]
    fn test_mid_requests_route_to_arena() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        let p = alloc.alloc(600).expect("arena alloc failed");
        assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
        assert!(alloc.arena().contains(p.as_ptr()));
        assert!(!alloc.pools().iter().any(|pool| pool.belongs(p.as_ptr())));

        // Safety: p is live.
        unsafe { alloc.free(p.as_ptr()) };
        let s = alloc.arena().stats();
        assert_eq!(s.free_blocks, 1);
        assert_eq!(s.largest_free_block, alloc.arena().pool_size());

        alloc.destroy();
    }

    #[test]
    fn test_large_requests_route_to_direct_mappings() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        let p = alloc.alloc(11 << 20).expect("direct alloc failed");
        let q = alloc.alloc(20 << 20).expect("direct alloc failed");
        assert_ne!(p, q);
        assert_eq!(p.as_ptr() as usize % ALIGNMENT, 0);
        assert_eq!(q.as_ptr() as usize % ALIGNMENT, 0);

        for ptr in [p, q] {
            assert!(alloc.direct().owns(ptr.as_ptr()));
            assert!(!alloc.arena().contains(ptr.as_ptr()));
            assert!(!alloc.pools().iter().any(|pool| pool.belongs(ptr.as_ptr())));
        }

        // Safety: both are live.
        unsafe {
            alloc.free(p.as_ptr());
            alloc.free(q.as_ptr());
        }
        assert_eq!(alloc.direct().outstanding(), 0);

        alloc.destroy();
    }

    #[test]
    fn test_exactly_threshold_stays_below_direct_tier() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = TieredAllocatorConfig {
            arena_size: 64 * 1024,
            os_threshold: 32 * 1024,
            ..TieredAllocatorConfig::default()
        };
        let mut alloc = TieredAllocator::with_config(&config);
        alloc.init().unwrap();

        // A request of exactly the threshold is not "direct"; one byte over
        // is.
        let at = alloc.alloc(32 * 1024).expect("arena alloc failed");
        assert!(alloc.arena().contains(at.as_ptr()));

        let over = alloc.alloc(32 * 1024 + 1).expect("direct alloc failed");
        assert!(alloc.direct().owns(over.as_ptr()));

        // Safety: both are live.
        unsafe {
            alloc.free(at.as_ptr());
            alloc.free(over.as_ptr());
        }
        alloc.destroy();
    }

    #[test]
    fn test_pool_exhaustion_falls_through_to_arena() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        // Drain the 16-byte pool completely.
        let mut ptrs = Vec::with_capacity(BLOCKS_PER_POOL + 1);
        for _ in 0..BLOCKS_PER_POOL {
            let p = alloc.alloc(10).expect("pool alloc failed");
            assert!(alloc.pools()[0].belongs(p.as_ptr()));
            ptrs.push(p);
        }
        assert!(!alloc.pools()[0].has_free_blocks());

        // The next one must still succeed, served by the arena.
        let extra = alloc.alloc(10).expect("fall-through alloc failed");
        assert_eq!(extra.as_ptr() as usize % ALIGNMENT, 0);
        assert!(alloc.arena().contains(extra.as_ptr()));
        ptrs.push(extra);

        for p in ptrs {
            // Safety: each pointer is freed exactly once.
            unsafe { alloc.free(p.as_ptr()) };
        }
        assert_eq!(alloc.pools()[0].free_block_count(), BLOCKS_PER_POOL);

        alloc.destroy();
    }

    #[test]
    fn test_arena_exhaustion_is_final() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let config = TieredAllocatorConfig {
            arena_size: 8 * 1024,
            ..TieredAllocatorConfig::default()
        };
        let mut alloc = TieredAllocator::with_config(&config);
        alloc.init().unwrap();

        let p = alloc.alloc(7 * 1024).expect("arena alloc failed");
        // The arena cannot fit another 7 KiB and there is no OS spill below
        // the threshold.
        assert!(alloc.alloc(7 * 1024).is_none());

        // Safety: p is live.
        unsafe { alloc.free(p.as_ptr()) };
        alloc.destroy();
    }

    #[test]
    fn test_destroy_returns_every_mapping() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let total_before = stats::TOTAL_MAPPED.get();

        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        let _small = alloc.alloc(24).unwrap();
        let _mid = alloc.alloc(4096).unwrap();
        let _large = alloc.alloc(11 << 20).unwrap();
        assert!(stats::TOTAL_MAPPED.get() > total_before);

        // destroy sweeps the never-freed direct block too.
        alloc.destroy();
        assert_eq!(stats::TOTAL_MAPPED.get(), total_before);
    }

    #[test]
    fn test_stats_snapshot_reflects_direct_blocks() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        let live_before = alloc.stats().os_direct_live;
        let p = alloc.alloc(12 << 20).unwrap();
        assert_eq!(alloc.stats().os_direct_live, live_before + 1);

        // Safety: p is live.
        unsafe { alloc.free(p.as_ptr()) };
        assert_eq!(alloc.stats().os_direct_live, live_before);

        alloc.destroy();
    }

    #[test]
    fn test_dumps_do_not_panic() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let mut alloc = TieredAllocator::new();
        alloc.init().unwrap();

        let a = alloc.alloc(10).unwrap();
        let b = alloc.alloc(2000).unwrap();
        let c = alloc.alloc(11 << 20).unwrap();
        alloc.dump_stat();
        alloc.dump_blocks();

        // Safety: all three are live.
        unsafe {
            alloc.free(a.as_ptr());
            alloc.free(b.as_ptr());
            alloc.free(c.as_ptr());
        }
        alloc.destroy();
    }
}
