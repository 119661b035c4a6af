use std::fmt;
use std::ptr::NonNull;

#[derive(Debug)]
pub enum PageError {
    MapFailed(std::io::Error),
    UnmapFailed(std::io::Error),
    InitFailed(String),
}

impl fmt::Display for PageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageError::MapFailed(e) => write!(f, "page mapping failed: {e}"),
            PageError::UnmapFailed(e) => write!(f, "page unmapping failed: {e}"),
            PageError::InitFailed(msg) => write!(f, "allocator initialization failed: {msg}"),
        }
    }
}

impl std::error::Error for PageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PageError::MapFailed(e) | PageError::UnmapFailed(e) => Some(e),
            PageError::InitFailed(_) => None,
        }
    }
}

/// Abstract source of raw backing memory.
///
/// Every tier obtains its arena through this interface and returns it here
/// on destroy. Mappings are independent regions; the tiers rely on that
/// disjointness to identify ownership by address alone.
pub(crate) trait PageSource {
    /// Map `size` bytes of zeroed, read-write memory aligned to at least the
    /// page size.
    unsafe fn map(size: usize) -> Result<NonNull<u8>, PageError>;

    /// Release a mapping previously returned by [`PageSource::map`], after
    /// which pointers into it are invalid.
    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), PageError>;

    /// OS page size.
    fn page_size() -> usize;
}

pub(crate) struct SystemPages;

#[cfg(all(unix, not(miri)))]
mod unix {
    use super::{NonNull, PageError, PageSource, SystemPages};
    use std::io;

    impl PageSource for SystemPages {
        unsafe fn map(size: usize) -> Result<NonNull<u8>, PageError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(PageError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(PageError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(PageError::UnmapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size() -> usize {
            use std::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: this crate supports only 64-bit targets; the
                // page size fits in usize there.
                #[allow(clippy::cast_sign_loss)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed fallback (Miri, non-unix targets)
//
// Under Miri we cannot issue real VM syscalls. Instead every mapping is
// backed by a plain page-aligned heap allocation via `std::alloc`. The
// memory is zeroed, matching the anonymous-mmap contract the tiers rely on.
// Actual page behaviour is exercised by the unix implementation in normal
// builds.
// ---------------------------------------------------------------------------
#[cfg(any(miri, not(unix)))]
impl PageSource for SystemPages {
    unsafe fn map(size: usize) -> Result<NonNull<u8>, PageError> {
        if size == 0 {
            return Err(PageError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| PageError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            PageError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> Result<(), PageError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| PageError::UnmapFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}
