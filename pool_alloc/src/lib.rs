//! Two-tier memory allocator
//!
//! * [SystemAllocator] forwards to a [Platform] heap and, when the heap is
//!   exhausted, retries for as long as an installed [OomHandler] keeps
//!   releasing memory.
//! * [PoolAllocator] serves small requests (up to [CEILING] bytes) from
//!   segregated free lists that are refilled in batches from bump arenas,
//!   and forwards everything else to a [SystemAllocator].
//!
//! Callers must hand back the same byte count they allocated with. Neither
//! tier stores block headers.

pub mod error;
pub mod pool;
pub mod raw_alloc;
pub mod shared;
pub mod system;

mod loom_testing;
mod util;

#[cfg(test)]
mod test_platform;

pub use error::{AllocError, Unrecoverable};
pub use pool::{PoolAllocator, CEILING, GRANULARITY, NUM_CLASSES, REFILL_COUNT};
pub use raw_alloc::RawAlloc;
pub use shared::{with_local_pool, SharedPool};
pub use system::{OomHandler, Platform, SystemAllocator, SystemPlatform, WORD_ALIGN};
