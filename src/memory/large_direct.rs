use super::pages::{PageSource, SystemPages};
use super::stats;
use std::ptr::NonNull;

/// Bookkeeping for one outstanding direct mapping.
struct DirectBlock {
    ptr: NonNull<u8>,
    size: usize,
}

/// Passthrough tier for requests above the large threshold.
///
/// Every allocation is its own page mapping, recorded in an outstanding
/// table so that ownership can be answered by address equality alone. The
/// table is scanned linearly; the threshold keeps it short.
pub struct LargeDirect {
    blocks: Vec<DirectBlock>,
}

// LargeDirect owns each recorded mapping exclusively.
// Safety: the raw pointers are handed out but never shared internally.
unsafe impl Send for LargeDirect {}

impl LargeDirect {
    #[must_use]
    pub const fn new() -> Self {
        Self { blocks: Vec::new() }
    }

    /// Map `size` bytes directly and record the block. Returns `None` when
    /// the page source refuses.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        // Safety: size is non-zero.
        match unsafe { SystemPages::map(size) } {
            Ok(ptr) => {
                self.blocks.push(DirectBlock { ptr, size });
                stats::TOTAL_MAPPED.add(size);
                stats::OS_DIRECT_MAPPED.add(size);
                stats::OS_DIRECT_LIVE.add(1);
                Some(ptr)
            }
            Err(_e) => {
                #[cfg(debug_assertions)]
                eprintln!("[memory] direct mapping of {size} bytes failed: {_e}");
                None
            }
        }
    }

    /// True iff `ptr` is the start of an outstanding direct mapping.
    #[must_use]
    pub fn owns(&self, ptr: *const u8) -> bool {
        self.blocks.iter().any(|b| b.ptr.as_ptr().cast_const() == ptr)
    }

    /// Release the mapping starting at `ptr` and drop its record.
    ///
    /// # Safety
    /// - `ptr` must be an outstanding mapping returned by `Self::alloc`.
    /// - `ptr` must not be used after this call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        let Some(pos) = self.blocks.iter().position(|b| b.ptr == ptr) else {
            debug_assert!(false, "pointer {ptr:p} is not an outstanding direct mapping");
            return;
        };
        let block = self.blocks.remove(pos);

        stats::TOTAL_MAPPED.sub(block.size);
        stats::OS_DIRECT_MAPPED.sub(block.size);
        stats::OS_DIRECT_LIVE.sub(1);

        // Safety: the record proves ptr came from SystemPages::map with
        // this exact size.
        unsafe {
            drop(SystemPages::unmap(block.ptr, block.size));
        }
    }

    /// Release every outstanding mapping. The destroy-time safety net for
    /// blocks the client never returned.
    pub fn release_all(&mut self) {
        for block in self.blocks.drain(..) {
            stats::TOTAL_MAPPED.sub(block.size);
            stats::OS_DIRECT_MAPPED.sub(block.size);
            stats::OS_DIRECT_LIVE.sub(1);
            // Safety: each record came from SystemPages::map.
            unsafe {
                drop(SystemPages::unmap(block.ptr, block.size));
            }
        }
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    pub fn dump_stat(&self) {
        println!(
            "[os-direct] outstanding blocks: {}, total memory: {} bytes",
            self.outstanding(),
            self.total_bytes()
        );
    }

    pub fn dump_blocks(&self) {
        if self.blocks.is_empty() {
            println!("[os-direct] no outstanding blocks");
            return;
        }
        for (i, block) in self.blocks.iter().enumerate() {
            println!(
                "[os-direct] block {i}: address={:p}, size={} bytes",
                block.ptr.as_ptr(),
                block.size
            );
        }
    }
}

impl Default for LargeDirect {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeDirect {
    fn drop(&mut self) {
        self.release_all();
    }
}
