#[cfg(not(target_pointer_width = "64"))]
compile_error!("tieralloc supports only 64-bit targets.");

// public module: contains implementation details (hidden via pub(crate))
pub mod memory;

// allocator tiers
pub use memory::coalesce::{ArenaStats, CoalesceArena};
pub use memory::fixed_pool::FixedPool;
pub use memory::large_direct::LargeDirect;

// dispatch/stats
pub use memory::manager::{
    ARENA_INITIAL_SIZE, BLOCKS_PER_POOL, CLASS_SIZES, NUM_CLASSES, OS_THRESHOLD, TieredAllocator,
    TieredAllocatorConfig, TieredStats,
};

// errors
pub use memory::pages::PageError;

pub use memory::ALIGNMENT;
