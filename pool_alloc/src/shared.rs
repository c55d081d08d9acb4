//! Ways of using a pool from more than one place
//!
//! [PoolAllocator] itself never synchronizes. To use one from several
//! threads it has to be put behind a lock ([SharedPool]), or each thread can
//! keep its own ([with_local_pool]).

use std::{cell::RefCell, ptr::NonNull};

use tracing::Level;

use crate::{
    error::AllocError,
    loom_testing::{Mutex, MutexGuard},
    pool::PoolAllocator,
    system::{Platform, SystemPlatform},
};

/// A pool behind a mutex
///
/// Every operation holds the lock for its whole duration, including any time
/// spent inside the OOM handler.
#[derive(Debug)]
pub struct SharedPool<P: Platform = SystemPlatform> {
    inner: Mutex<PoolAllocator<P>>,
}

impl SharedPool<SystemPlatform> {
    pub fn new() -> Self {
        Self::from_pool(PoolAllocator::new())
    }
}

impl Default for SharedPool<SystemPlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> SharedPool<P> {
    pub fn from_pool(pool: PoolAllocator<P>) -> Self {
        Self {
            inner: Mutex::new(pool),
        }
    }

    /// Exclusive access to the pool, e.g. to install an OOM handler or to
    /// batch several operations under one lock
    pub fn lock(&self) -> MutexGuard<'_, PoolAllocator<P>> {
        // a panic while holding the lock can only come from a contract check,
        // after which the pool state is still consistent
        self.inner.lock().unwrap_or_else(|e| {
            tracing::event!(Level::TRACE, "shared pool lock was poisoned");
            e.into_inner()
        })
    }

    pub fn allocate(&self, bytes: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        self.lock().allocate(bytes)
    }

    /// # Safety
    /// Same contract as [PoolAllocator::deallocate].
    pub unsafe fn deallocate(&self, ptr: Option<NonNull<u8>>, bytes: usize) {
        self.lock().deallocate(ptr, bytes)
    }

    /// # Safety
    /// Same contract as [PoolAllocator::reallocate].
    pub unsafe fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        self.lock().reallocate(ptr, old_bytes, new_bytes)
    }
}

thread_local! {
    static LOCAL_POOL: RefCell<PoolAllocator> = RefCell::new(PoolAllocator::new());
}

/// Run `f` with this thread's own pool, creating it on first use
///
/// Blocks from the local pool must be freed on the same thread. The pool,
/// and every block still allocated from it, goes away when the thread exits.
///
/// # Panics
/// Panics if called again from inside `f`.
pub fn with_local_pool<R>(f: impl FnOnce(&mut PoolAllocator) -> R) -> R {
    LOCAL_POOL.with(|pool| f(&mut pool.borrow_mut()))
}
