pub(crate) mod coalesce;
pub(crate) mod fixed_pool;
pub(crate) mod large_direct;
pub(crate) mod manager;
pub(crate) mod pages;
pub(crate) mod stats;

/// Universal alignment, in bytes, for every user-visible pointer and every
/// internal structure. Requested sizes are rounded up to a multiple of this
/// before routing.
pub const ALIGNMENT: usize = 8;

/// Round `n` up to the next multiple of [`ALIGNMENT`].
pub(crate) const fn align_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

// Serializes tests that assert on the process-wide gauges in `stats`.
// Tests that only read their own instances take the lock shared.
#[cfg(test)]
pub(crate) static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
