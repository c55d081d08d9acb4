//! First-tier allocator
//!
//! A thin layer over the platform heap. Its only policy is what happens when
//! the platform says no: if an OOM handler is installed it is called, and the
//! request is retried, for as long as the handler keeps reporting progress.
//! Without a handler the failure is returned to the caller right away.

use std::{
    alloc::{self, Layout},
    fmt::{self, Debug},
    mem,
    ptr::NonNull,
};

use tracing::Level;

use crate::{
    error::{AllocError, Unrecoverable},
    raw_alloc::RawAlloc,
    util::UsizePtr,
};

/// Alignment of every block handed out by either tier
pub const WORD_ALIGN: usize = mem::align_of::<usize>();

/// Callback invoked when the platform cannot satisfy a request
///
/// It is expected to release memory somewhere else and return `Ok(())`, in
/// which case the request is retried. Returning [Unrecoverable] stops the
/// retry loop. A handler that keeps returning `Ok(())` without freeing
/// anything will make the loop spin forever.
pub type OomHandler = Box<dyn FnMut() -> Result<(), Unrecoverable> + Send>;

/// Backend that actually hands out memory
///
/// Returning `None` means the request could not be satisfied right now.
/// Whether to retry is decided by the caller, never by the backend.
pub trait Platform: Debug {
    /// Obtain `bytes` bytes aligned to [WORD_ALIGN]
    fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>>;

    /// Resize a block, possibly moving it
    ///
    /// On `None` the original block is left untouched.
    ///
    /// # Safety
    /// `ptr` must have come from this platform with a size of `old_bytes`.
    unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>>;

    /// Release a block
    ///
    /// # Safety
    /// `ptr` must have come from this platform with a size of `bytes`
    /// and must not be used afterwards.
    unsafe fn free(&mut self, ptr: NonNull<u8>, bytes: usize);
}

/// The process heap, via [std::alloc]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

/// Zero-sized requests are bumped to one byte so that the layout passed to
/// `alloc` and `dealloc` always agree
fn word_layout(bytes: usize) -> Option<Layout> {
    Layout::from_size_align(bytes.max(1), WORD_ALIGN).ok()
}

impl Platform for SystemPlatform {
    fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = word_layout(bytes)?;
        // safety: layout has a non-zero size
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        let old_layout = word_layout(old_bytes)?;
        // checks that the new size is still a valid layout
        let new_layout = word_layout(new_bytes)?;
        NonNull::new(alloc::realloc(ptr.as_ptr(), old_layout, new_layout.size()))
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, bytes: usize) {
        if let Some(layout) = word_layout(bytes) {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// First-tier allocator with a single OOM handler slot
pub struct SystemAllocator<P: Platform = SystemPlatform> {
    platform: P,
    oom_handler: Option<OomHandler>,
    /// Number of times the handler has been called, for diagnostics
    oom_invocations: u64,
}

impl<P: Platform> Debug for SystemAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemAllocator")
            .field("platform", &self.platform)
            .field("oom_handler", &self.oom_handler.as_ref().map(|_| "<handler>"))
            .field("oom_invocations", &self.oom_invocations)
            .finish()
    }
}

impl SystemAllocator<SystemPlatform> {
    pub fn new() -> Self {
        Self::with_platform(SystemPlatform)
    }
}

impl Default for SystemAllocator<SystemPlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> SystemAllocator<P> {
    pub fn with_platform(platform: P) -> Self {
        Self {
            platform,
            oom_handler: None,
            oom_invocations: 0,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Direct access to the backend, skipping the OOM handler entirely
    pub(crate) fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    /// Install a new OOM handler (or remove it with `None`),
    /// returning whichever handler was installed before
    pub fn set_oom_handler(&mut self, handler: Option<OomHandler>) -> Option<OomHandler> {
        tracing::event!(
            name: "system::set_oom_handler",
            Level::TRACE,
            installed = handler.is_some()
        );
        mem::replace(&mut self.oom_handler, handler)
    }

    pub fn has_oom_handler(&self) -> bool {
        self.oom_handler.is_some()
    }

    /// How many times the OOM handler has been called so far
    pub fn oom_invocations(&self) -> u64 {
        self.oom_invocations
    }

    /// Allocate `bytes` bytes
    ///
    /// Zero bytes yields `Ok(None)`, which is not an error.
    pub fn allocate(&mut self, bytes: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if bytes == 0 {
            return Ok(None);
        }
        if let Some(ptr) = self.platform.alloc(bytes) {
            return Ok(Some(ptr));
        }
        self.oom_retry(bytes, |platform| platform.alloc(bytes))
            .map(Some)
    }

    /// Resize a block obtained from [allocate](Self::allocate)
    ///
    /// A null `ptr` is a no-op returning `Ok(None)`. Resizing to zero bytes
    /// releases the block and also returns `Ok(None)`. On failure the
    /// original block is still valid and still owned by the caller.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator with a size of `old_bytes`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(ptr) = ptr else {
            return Ok(None);
        };
        if new_bytes == 0 {
            self.deallocate(Some(ptr), old_bytes);
            return Ok(None);
        }
        if let Some(new_ptr) = self.platform.realloc(ptr, old_bytes, new_bytes) {
            return Ok(Some(new_ptr));
        }
        self.oom_retry(new_bytes, |platform| {
            platform.realloc(ptr, old_bytes, new_bytes)
        })
        .map(Some)
    }

    /// Release a block obtained from [allocate](Self::allocate)
    ///
    /// A null `ptr` is a no-op.
    ///
    /// # Safety
    /// `ptr` must have come from this allocator with a size of `bytes`
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>, bytes: usize) {
        if let Some(ptr) = ptr {
            self.platform.free(ptr, bytes);
        }
    }

    /// Call the handler and retry `attempt` until it succeeds or the handler
    /// gives up
    fn oom_retry<F>(&mut self, requested: usize, mut attempt: F) -> Result<NonNull<u8>, AllocError>
    where
        F: FnMut(&mut P) -> Option<NonNull<u8>>,
    {
        let trace_span = tracing::span!(Level::TRACE, "system::oom_retry", requested);
        let _span_enter = trace_span.enter();

        loop {
            let Some(handler) = self.oom_handler.as_mut() else {
                tracing::event!(Level::TRACE, "no oom handler installed");
                return Err(AllocError::OutOfMemory { requested });
            };

            self.oom_invocations += 1;
            tracing::event!(
                Level::TRACE,
                invocation = self.oom_invocations,
                "calling oom handler"
            );
            if handler().is_err() {
                tracing::event!(Level::TRACE, "oom handler gave up");
                return Err(AllocError::OutOfMemory { requested });
            }

            if let Some(ptr) = attempt(&mut self.platform) {
                tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(ptr), "retry succeeded");
                return Ok(ptr);
            }
        }
    }
}

impl<P: Platform> RawAlloc for SystemAllocator<P> {
    fn allocate(&mut self, bytes: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        SystemAllocator::allocate(self, bytes)
    }

    unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>, bytes: usize) {
        SystemAllocator::deallocate(self, ptr, bytes)
    }

    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        SystemAllocator::reallocate(self, ptr, old_bytes, new_bytes)
    }
}

#[cfg(test)]
mod tests;
