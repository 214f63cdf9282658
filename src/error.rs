//! Error types used by the pool and its backing stores

/// General error returned by [`ObjectPool`](crate::pool::ObjectPool) and
/// [`BackingStore`](crate::store::BackingStore) implementations.
///
/// A "skipped" lifecycle transition is NOT an error, see
/// [`LoadOutcome`](crate::lifecycle::LoadOutcome) and
/// [`UnloadOutcome`](crate::lifecycle::UnloadOutcome).
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The backing store could not satisfy a growth request, or the pool has
    /// run out of addressable slots.
    ///
    /// Surfaced synchronously to the caller of `create` or of the pool
    /// constructors, and never retried automatically.
    #[error("Allocation failed! {size} bytes aligned to {align}")]
    AllocationFailure {
        /// Size of the refused request in bytes
        size: usize,
        /// Alignment of the refused request in bytes
        align: usize,
    },
    /// The requested item layout cannot be represented, e.g. because the
    /// alignment is not a power of two.
    #[error("Invalid item layout! {size} bytes aligned to {align}")]
    InvalidLayout {
        /// Item size in bytes
        size: usize,
        /// Requested alignment in bytes
        align: usize,
    },
}
