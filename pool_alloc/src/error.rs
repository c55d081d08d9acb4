//! Error types shared by both allocator tiers

use thiserror::Error;

/// Failure of an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The platform could not supply the memory, and either no OOM handler
    /// was installed or the handler gave up
    #[error("out of memory: could not obtain {requested} bytes")]
    OutOfMemory { requested: usize },
    /// `n * size_of::<T>()` does not fit in a `usize`
    #[error("array allocation of {count} x {elem_size} bytes overflows usize")]
    CapacityOverflow { count: usize, elem_size: usize },
    /// Element type needs more than natural word alignment
    #[error("alignment {align} is larger than the supported word alignment")]
    UnsupportedAlignment { align: usize },
}

/// Returned by an OOM handler that cannot free any more memory
///
/// This ends the retry loop and the pending request fails with
/// [AllocError::OutOfMemory].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("oom handler could not release any memory")]
pub struct Unrecoverable;
