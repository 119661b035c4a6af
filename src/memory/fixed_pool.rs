use super::pages::{PageError, PageSource, SystemPages};
use super::stats;
use super::{ALIGNMENT, align_up};
use fixedbitset::FixedBitSet;
use std::ptr::NonNull;

// Block rows printed by `dump_blocks` before eliding the rest.
const DUMP_BLOCK_CAP: usize = 100;

/// Pool of uniform-size blocks backed by a single contiguous mapping.
///
/// The free list lives inside the free blocks themselves: the first word of
/// every free block holds the integer index of the next free block, with
/// `block_count` as the end-of-list sentinel. A used block carries no
/// metadata at all, so the pool can serve blocks as small as one machine
/// word. The head is a pointer rather than an index so that the empty state
/// is a distinguishable null.
pub struct FixedPool {
    block_size: usize,
    block_count: usize,
    base: Option<NonNull<u8>>,
    free_head: Option<NonNull<usize>>,
    live: usize,
}

// FixedPool owns its mapping exclusively between init and destroy.
// Safety: the raw pointers never alias another pool's region.
unsafe impl Send for FixedPool {}

impl FixedPool {
    /// Create an uninitialized pool serving `block_count` blocks of
    /// `block_size` bytes (rounded up to [`ALIGNMENT`]).
    ///
    /// # Panics
    ///
    /// Panics if `block_size` cannot hold a free-list index or if
    /// `block_count` is zero.
    #[must_use]
    pub fn new(block_size: usize, block_count: usize) -> Self {
        assert!(
            block_size >= ALIGNMENT,
            "block size must hold at least one free-list index"
        );
        assert!(block_count > 0, "block count must be positive");
        Self {
            block_size: align_up(block_size),
            block_count,
            base: None,
            free_head: None,
            live: 0,
        }
    }

    /// Acquire the backing mapping and thread every block onto the free
    /// list in ascending order. No-op on an already-initialized pool.
    ///
    /// # Errors
    ///
    /// Returns `PageError` if the arena size overflows or the mapping fails.
    pub fn init(&mut self) -> Result<(), PageError> {
        if self.base.is_some() {
            return Ok(());
        }

        let arena_size = self
            .block_size
            .checked_mul(self.block_count)
            .ok_or_else(|| PageError::InitFailed("fixed pool arena size overflow".to_string()))?;

        // Safety: arena_size is non-zero (both factors are).
        let base = unsafe { SystemPages::map(arena_size)? };

        // The first word of free block i names block i + 1; the last block
        // holds the `block_count` sentinel.
        for i in 0..self.block_count {
            // Safety: i * block_size stays within the fresh mapping, and the
            // slot is ALIGNMENT-aligned because block_size is.
            unsafe {
                base.as_ptr()
                    .add(i * self.block_size)
                    .cast::<usize>()
                    .write(i + 1);
            }
        }

        self.free_head = Some(base.cast());
        self.base = Some(base);

        stats::TOTAL_MAPPED.add(arena_size);
        stats::FIXED_POOL_MAPPED.add(arena_size);
        Ok(())
    }

    /// Release the backing mapping. No-op on an uninitialized pool.
    pub fn destroy(&mut self) {
        let Some(base) = self.base.take() else {
            return;
        };
        let arena_size = self.arena_size();
        self.free_head = None;

        stats::TOTAL_MAPPED.sub(arena_size);
        stats::FIXED_POOL_MAPPED.sub(arena_size);
        stats::FIXED_POOL_LIVE.sub(self.live);
        self.live = 0;

        // Safety: base came from SystemPages::map with this exact size.
        unsafe {
            drop(SystemPages::unmap(base, arena_size));
        }
    }

    /// Pop the head of the free list, or `None` when the pool is exhausted
    /// or uninitialized.
    pub fn alloc(&mut self) -> Option<NonNull<u8>> {
        let head = self.free_head?;

        // Safety: head points at a free block inside the mapping; its first
        // word is the next-free index.
        let next = unsafe { head.as_ptr().read() };
        self.free_head = if next == self.block_count {
            None
        } else {
            // Safety: next < block_count, so the slot lies inside the arena.
            Some(unsafe { self.block_ptr(next) }.cast())
        };

        self.live += 1;
        stats::FIXED_POOL_LIVE.add(1);
        Some(head.cast())
    }

    /// Push a block back onto the free list. Pure pointer surgery, no
    /// metadata lookup.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `Self::alloc` on this exact pool.
    /// - `ptr` must not have been freed already.
    /// - `ptr` must not be used after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        debug_assert!(
            self.belongs(ptr.as_ptr()),
            "pointer {ptr:p} does not belong to this FixedPool"
        );
        debug_assert!(self.live > 0, "free without a matching alloc");

        // The freed block records the index the head currently represents,
        // then becomes the new head.
        let next_index = match self.free_head {
            Some(head) => self.index_of(head.cast()),
            None => self.block_count,
        };
        // Safety: per contract the block is ours again; its first word is
        // free-list storage.
        unsafe {
            ptr.cast::<usize>().as_ptr().write(next_index);
        }
        self.free_head = Some(ptr.cast());

        self.live -= 1;
        stats::FIXED_POOL_LIVE.sub(1);
    }

    /// True iff `ptr` is a block start inside this pool's arena. False for
    /// null and for uninitialized pools. Never dereferences `ptr`.
    #[must_use]
    pub fn belongs(&self, ptr: *const u8) -> bool {
        let Some(base) = self.base else {
            return false;
        };
        let addr = ptr as usize;
        let base_addr = base.as_ptr() as usize;
        if addr < base_addr {
            return false;
        }
        let offset = addr - base_addr;
        offset < self.arena_size() && offset.is_multiple_of(self.block_size)
    }

    #[must_use]
    pub fn has_free_blocks(&self) -> bool {
        self.free_head.is_some()
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.base.is_some()
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.block_count
    }

    #[must_use]
    pub fn used_block_count(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.block_count - self.live
    }

    fn arena_size(&self) -> usize {
        // Checked once in init; a live pool cannot overflow this.
        self.block_size * self.block_count
    }

    /// Address of the block with the given index.
    ///
    /// # Safety
    /// The pool must be initialized and `index < block_count`.
    unsafe fn block_ptr(&self, index: usize) -> NonNull<u8> {
        let base = self.base.expect("pool not initialized");
        // Safety: index is in range per contract.
        unsafe { NonNull::new_unchecked(base.as_ptr().add(index * self.block_size)) }
    }

    /// Index of a block known to lie inside the arena.
    fn index_of(&self, ptr: NonNull<u8>) -> usize {
        let base_addr = self.base.expect("pool not initialized").as_ptr() as usize;
        (ptr.as_ptr() as usize - base_addr) / self.block_size
    }

    /// Walk the intrusive free list into a bitset of free indices. The walk
    /// is bounded by `block_count` and terminates early on an index outside
    /// the arena, so a corrupt chain cannot loop or read out of bounds.
    fn collect_free_set(&self) -> FixedBitSet {
        let mut free_set = FixedBitSet::with_capacity(self.block_count);
        let mut cursor = self.free_head;
        let mut visited = 0;
        while let Some(slot) = cursor {
            if visited >= self.block_count {
                break;
            }
            free_set.insert(self.index_of(slot.cast()));
            visited += 1;

            // Safety: slot is a free block inside the mapping.
            let next = unsafe { slot.as_ptr().read() };
            cursor = if next >= self.block_count {
                None
            } else {
                // Safety: next < block_count.
                Some(unsafe { self.block_ptr(next) }.cast())
            };
        }
        free_set
    }

    /// One-line summary of pool occupancy.
    pub fn dump_stat(&self) {
        let Some(base) = self.base else {
            println!("[fixed-pool] not initialized");
            return;
        };
        println!(
            "[fixed-pool] block size: {}, total blocks: {}, free: {}, used: {}, range: [{:p} - {:p})",
            self.block_size,
            self.block_count,
            self.free_block_count(),
            self.used_block_count(),
            base.as_ptr(),
            // Safety: one-past-the-end address computed without deref.
            unsafe { base.as_ptr().add(self.arena_size()) },
        );
    }

    /// Per-block table reconstructed by walking the intrusive free list.
    pub fn dump_blocks(&self) {
        let Some(base) = self.base else {
            println!("[fixed-pool] not initialized");
            return;
        };

        println!("[fixed-pool] memory dump:");
        println!("  start address: {:p}", base.as_ptr());
        println!("  block size: {} bytes", self.block_size);
        println!("  total blocks: {}", self.block_count);
        println!("  total memory: {} bytes", self.arena_size());
        println!();

        let free_set = self.collect_free_set();

        println!("  block#  address             status  next");
        println!("  ----------------------------------------");
        for i in 0..self.block_count.min(DUMP_BLOCK_CAP) {
            // Safety: i < block_count.
            let addr = unsafe { self.block_ptr(i) };
            print!("  {i:>6}  {:>18p}  ", addr.as_ptr());
            if free_set.contains(i) {
                // Safety: free blocks carry their next index in word 0.
                let next = unsafe { addr.cast::<usize>().as_ptr().read() };
                if next == self.block_count {
                    println!("FREE    END");
                } else {
                    println!("FREE    -> block {next}");
                }
            } else {
                println!("USED    -");
            }
        }
        if self.block_count > DUMP_BLOCK_CAP {
            println!("  ... ({} more blocks)", self.block_count - DUMP_BLOCK_CAP);
        }
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.destroy();
    }
}
