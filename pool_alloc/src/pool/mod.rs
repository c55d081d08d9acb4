//! Second-tier allocator: segregated free lists carved out of bump arenas
//!
//! Requests of up to [CEILING] bytes are rounded up to a multiple of
//! [GRANULARITY] and served from one of [NUM_CLASSES] intrusive free lists.
//! When a list runs dry it is refilled with up to [REFILL_COUNT] objects
//! carved off the current arena, and when the arena runs dry a new one is
//! obtained from the platform. Anything larger than [CEILING] goes straight
//! to the [SystemAllocator].
//!
//! The pool is strictly single-threaded: every operation takes `&mut self`
//! and the type is not `Sync`. See [crate::shared] for ways of sharing one.

use std::{
    fmt::{self, Debug},
    mem::{self, size_of},
    ptr::{self, NonNull},
};

use rustc_hash::FxHashSet;
use tracing::Level;

use crate::{
    error::AllocError,
    raw_alloc::RawAlloc,
    system::{OomHandler, Platform, SystemAllocator, SystemPlatform, WORD_ALIGN},
    util::{roundto, UsizePtr},
};

#[cfg(debug_assertions)]
mod checks;

/// Size classes are spaced this many bytes apart
pub const GRANULARITY: usize = 8;
/// Largest request served from the free lists
pub const CEILING: usize = 128;
/// Number of free lists (one per size class)
pub const NUM_CLASSES: usize = CEILING / GRANULARITY;
/// Number of objects carved off the arena each time a free list is refilled
pub const REFILL_COUNT: usize = 20;

/// Size of the link stored inside every free block
const FREE_NODE_SZ: usize = size_of::<FreeNode>();

const _: () = assert!(GRANULARITY >= FREE_NODE_SZ);
const _: () = assert!(GRANULARITY % WORD_ALIGN == 0);
const _: () = assert!(CEILING % GRANULARITY == 0);

/// Round a request up to its size class
#[inline]
pub const fn round_up(size: usize) -> usize {
    roundto(size, GRANULARITY)
}

/// Free list index serving requests of `size` bytes (`1..=CEILING`)
#[inline]
pub const fn class_index(size: usize) -> usize {
    round_up(size) / GRANULARITY - 1
}

/// Usable size of every block on free list `class`
#[inline]
pub const fn class_size(class: usize) -> usize {
    (class + 1) * GRANULARITY
}

/// Contents of a pool block while it sits on a free list
///
/// Once the block is handed out this memory belongs to the caller.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Bump region currently being carved into objects
///
/// Invariant: `start <= end`. Both are null before the first arena exists.
#[derive(Clone, Copy)]
struct Arena {
    start: *mut u8,
    end: *mut u8,
}

impl Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("start", &UsizePtr::from(self.start))
            .field("end", &UsizePtr::from(self.end))
            .finish()
    }
}

impl Arena {
    const EMPTY: Self = Self {
        start: ptr::null_mut(),
        end: ptr::null_mut(),
    };

    fn new(base: NonNull<u8>, bytes: usize) -> Self {
        let start = base.as_ptr();
        Self {
            start,
            // safety: base points to an allocation of at least `bytes` bytes
            end: unsafe { start.add(bytes) },
        }
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.end as usize - self.start as usize
    }

    /// Bump `bytes` off the front
    fn carve(&mut self, bytes: usize) -> NonNull<u8> {
        debug_assert!(bytes > 0 && bytes <= self.remaining());
        let result = self.start;
        // safety: stays within [start, end] and start is non-null
        // whenever anything remains
        unsafe {
            self.start = self.start.add(bytes);
            NonNull::new_unchecked(result)
        }
    }

    fn contains(&self, addr: usize) -> bool {
        addr >= self.start as usize && addr < self.end as usize
    }
}

/// States of the arena refill cascade in [PoolAllocator::chunk_alloc]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkStep {
    /// Carve from whatever is left in the current arena
    TryArena,
    /// Ask the platform for a new arena, without the OOM handler
    TryPlatformAlloc,
    /// Adopt a free block of an equal or larger class as the arena
    TryScavenge,
    /// Ask the first tier, which may run the OOM handler
    TryOomHandler,
}

/// Segregated free-list pool allocator
pub struct PoolAllocator<P: Platform = SystemPlatform> {
    system: SystemAllocator<P>,
    /// Head of each size class free list
    free_lists: [*mut FreeNode; NUM_CLASSES],
    arena: Arena,
    /// Total bytes ever obtained for arenas (diagnostics only)
    heap_size: usize,
    /// Every block obtained as an arena, returned to the platform on drop
    owned_arenas: Vec<(NonNull<u8>, usize)>,
    #[cfg(debug_assertions)]
    checks: checks::ContractChecks,
}

// safety: the pool exclusively owns its arenas and every block on its free
// lists, so moving it to another thread moves all of that along with it
unsafe impl<P: Platform + Send> Send for PoolAllocator<P> {}

impl<P: Platform> Debug for PoolAllocator<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let free_list_lens: Vec<usize> = (0..NUM_CLASSES).map(|c| self.free_list_len(c)).collect();
        f.debug_struct("PoolAllocator")
            .field("@addr", &(self as *const _))
            .field("system", &self.system)
            .field("arena", &self.arena)
            .field("heap_size", &self.heap_size)
            .field("owned_arenas", &self.owned_arenas.len())
            .field("free_list_lens", &free_list_lens)
            .finish()
    }
}

impl PoolAllocator<SystemPlatform> {
    pub fn new() -> Self {
        Self::with_system(SystemAllocator::new())
    }
}

impl Default for PoolAllocator<SystemPlatform> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> PoolAllocator<P> {
    pub fn with_platform(platform: P) -> Self {
        Self::with_system(SystemAllocator::with_platform(platform))
    }

    /// Build a pool on top of an existing first tier
    /// (keeping whatever OOM handler it already has)
    pub fn with_system(system: SystemAllocator<P>) -> Self {
        Self {
            system,
            free_lists: [ptr::null_mut(); NUM_CLASSES],
            arena: Arena::EMPTY,
            heap_size: 0,
            owned_arenas: Vec::new(),
            #[cfg(debug_assertions)]
            checks: checks::ContractChecks::default(),
        }
    }

    pub fn system(&self) -> &SystemAllocator<P> {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut SystemAllocator<P> {
        &mut self.system
    }

    /// Shorthand for [SystemAllocator::set_oom_handler] on the first tier
    pub fn set_oom_handler(&mut self, handler: Option<OomHandler>) -> Option<OomHandler> {
        self.system.set_oom_handler(handler)
    }

    /// Total bytes ever obtained from the first tier for arenas
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    /// Bytes not yet carved from the current arena
    pub fn arena_remaining(&self) -> usize {
        self.arena.remaining()
    }

    /// Number of blocks on free list `class`
    pub fn free_list_len(&self, class: usize) -> usize {
        let mut len = 0;
        let mut node = self.free_lists[class];
        while !node.is_null() {
            len += 1;
            // safety: every node on a free list is a free block we own
            node = unsafe { (*node).next };
        }
        len
    }

    /// Bytes sitting on all free lists
    pub fn free_bytes(&self) -> usize {
        (0..NUM_CLASSES)
            .map(|class| self.free_list_len(class) * class_size(class))
            .sum()
    }

    /// Allocate `size` bytes
    ///
    /// Zero bytes yields `Ok(None)`. Requests above [CEILING] are forwarded
    /// to the first tier. The block's usable size is `round_up(size)`.
    pub fn allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        if size > CEILING {
            return self.system.allocate(size);
        }

        let class = class_index(size);
        let block = match self.pop_free(class) {
            Some(block) => block,
            None => self.refill(round_up(size))?,
        };

        #[cfg(debug_assertions)]
        self.checks.mark_live(block, class);

        Ok(Some(block))
    }

    /// Return a block to the pool
    ///
    /// A null `ptr` is a no-op. Blocks above [CEILING] go back to the first
    /// tier, everything else onto the free list of its size class.
    ///
    /// # Safety
    /// `ptr` must have come from this pool with a size of `size`, and must
    /// not be used afterwards. A wrong `size` threads the block onto the
    /// wrong free list (debug builds panic instead).
    pub unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>, size: usize) {
        let Some(ptr) = ptr else {
            return;
        };

        if size > CEILING {
            #[cfg(debug_assertions)]
            self.checks.assert_not_pool_block(ptr, size);

            self.system.deallocate(Some(ptr), size);
            return;
        }

        debug_assert!(size != 0, "non-null block deallocated with size 0");
        if size == 0 {
            return;
        }

        let class = class_index(size);

        #[cfg(debug_assertions)]
        self.checks.mark_free(ptr, class);

        self.push_free(class, ptr);
    }

    /// Resize a block by allocating a new one and copying
    ///
    /// Only when both sizes are above [CEILING] is the first tier's
    /// reallocate used. On failure the old block is left untouched.
    ///
    /// # Safety
    /// `ptr` must have come from this pool with a size of `old_size`.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(old) = ptr else {
            return Ok(None);
        };

        if old_size > CEILING && new_size > CEILING {
            #[cfg(debug_assertions)]
            self.checks.assert_not_pool_block(old, old_size);

            return self.system.reallocate(Some(old), old_size, new_size);
        }

        let new = self.allocate(new_size)?;
        if let Some(new) = new {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
        }
        self.deallocate(Some(old), old_size);
        Ok(new)
    }

    /// Pop the head of free list `class`
    #[inline]
    fn pop_free(&mut self, class: usize) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.free_lists[class])?;
        unsafe {
            #[cfg(debug_assertions)]
            checks::verify_poison(head.cast(), class_size(class));

            // safety: head is a free block we own
            self.free_lists[class] = (*head.as_ptr()).next;
        }
        Some(head.cast())
    }

    /// Push a block onto free list `class`
    ///
    /// # Safety
    /// `block` must be at least `class_size(class)` bytes, word aligned,
    /// and not in use by anyone.
    #[inline]
    unsafe fn push_free(&mut self, class: usize, block: NonNull<u8>) {
        let node = block.as_ptr() as *mut FreeNode;
        node.write(FreeNode {
            next: self.free_lists[class],
        });

        #[cfg(debug_assertions)]
        checks::poison(block, class_size(class));

        self.free_lists[class] = node;
    }

    /// Carve a batch of `size`-byte objects, hand out the first and thread
    /// the rest onto the free list for `size`
    fn refill(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let trace_span = tracing::span!(Level::TRACE, "pool::refill", size);
        let _span_enter = trace_span.enter();

        let mut count = REFILL_COUNT;
        let chunk = self.chunk_alloc(size, &mut count)?;
        tracing::event!(Level::TRACE, chunk = ?UsizePtr::from(chunk), count);

        let class = class_index(size);
        // pushed back to front so the list comes out in address order
        for i in (1..count).rev() {
            unsafe {
                // safety: object i lies inside the chunk we just carved
                let obj = NonNull::new_unchecked(chunk.as_ptr().add(i * size));
                self.push_free(class, obj);
            }
        }

        Ok(chunk)
    }

    /// Obtain room for `*count` objects of `size` bytes
    ///
    /// `*count` may be lowered if only part of the request fits in what is
    /// left of the arena, but is always at least 1 on success.
    fn chunk_alloc(&mut self, size: usize, count: &mut usize) -> Result<NonNull<u8>, AllocError> {
        let trace_span = tracing::span!(Level::TRACE, "pool::chunk_alloc", size, count = *count);
        let _span_enter = trace_span.enter();

        let bytes_to_get = 2 * *count * size;
        let mut step = ChunkStep::TryArena;
        loop {
            tracing::event!(Level::TRACE, ?step);
            step = match step {
                ChunkStep::TryArena => {
                    let total_bytes = *count * size;
                    let bytes_left = self.arena.remaining();
                    if bytes_left >= total_bytes {
                        return Ok(self.arena.carve(total_bytes));
                    }
                    if bytes_left >= size {
                        *count = bytes_left / size;
                        tracing::event!(Level::TRACE, count = *count, "partial refill");
                        return Ok(self.arena.carve(*count * size));
                    }
                    self.stash_leftover();
                    ChunkStep::TryPlatformAlloc
                }
                ChunkStep::TryPlatformAlloc => match self.system.platform_mut().alloc(bytes_to_get) {
                    Some(block) => {
                        self.install_arena(block, bytes_to_get);
                        ChunkStep::TryArena
                    }
                    None => ChunkStep::TryScavenge,
                },
                ChunkStep::TryScavenge => {
                    if self.scavenge(size) {
                        ChunkStep::TryArena
                    } else {
                        ChunkStep::TryOomHandler
                    }
                }
                ChunkStep::TryOomHandler => match self.system.allocate(bytes_to_get)? {
                    Some(block) => {
                        self.install_arena(block, bytes_to_get);
                        ChunkStep::TryArena
                    }
                    None => {
                        return Err(AllocError::OutOfMemory {
                            requested: bytes_to_get,
                        })
                    }
                },
            };
        }
    }

    /// Move whatever is left of the arena onto the free list for its own size
    fn stash_leftover(&mut self) {
        let bytes_left = self.arena.remaining();
        if bytes_left == 0 {
            return;
        }
        debug_assert!(bytes_left % GRANULARITY == 0);
        debug_assert!(bytes_left <= CEILING);

        let class = class_index(bytes_left);
        let block = self.arena.carve(bytes_left);
        tracing::event!(
            Level::TRACE,
            block = ?UsizePtr::from(block),
            bytes_left,
            class,
            "stashing arena leftover"
        );
        // safety: the leftover is exactly class_size(class) bytes of our arena
        unsafe { self.push_free(class, block) };
    }

    fn install_arena(&mut self, block: NonNull<u8>, bytes: usize) {
        tracing::event!(
            Level::TRACE,
            block = ?UsizePtr::from(block),
            bytes,
            "new arena"
        );
        debug_assert_eq!(self.arena.remaining(), 0);
        self.arena = Arena::new(block, bytes);
        self.heap_size += bytes;
        self.owned_arenas.push((block, bytes));
    }

    /// Adopt a free block of at least `size` bytes as the arena
    fn scavenge(&mut self, size: usize) -> bool {
        for class in class_index(size)..NUM_CLASSES {
            if let Some(block) = self.pop_free(class) {
                tracing::event!(
                    Level::TRACE,
                    block = ?UsizePtr::from(block),
                    class,
                    "scavenged free block as arena"
                );
                self.arena = Arena::new(block, class_size(class));
                return true;
            }
        }
        false
    }

    /// Walk every free list and check it for consistency
    ///
    /// Panics if a block is on the lists twice, overlaps the unused part of
    /// the arena, or lies outside every arena this pool owns.
    /// Returns the total number of free blocks.
    pub fn _debug_check_free_lists(&self) -> usize {
        let mut seen = FxHashSet::default();
        for class in 0..NUM_CLASSES {
            let sz = class_size(class);
            let mut node = self.free_lists[class];
            while !node.is_null() {
                let addr = node as usize;
                if !seen.insert(addr) {
                    panic!("Block 0x{:x} found on free lists multiple times!", addr);
                }
                if self.arena.contains(addr) || self.arena.contains(addr + sz - 1) {
                    panic!("Free block 0x{:x} overlaps the live arena!", addr);
                }
                let owned = self
                    .owned_arenas
                    .iter()
                    .any(|&(base, bytes)| {
                        let base = base.as_ptr() as usize;
                        addr >= base && addr + sz <= base + bytes
                    });
                if !owned {
                    panic!("Free block 0x{:x} (class {}) is not inside any arena!", addr, class);
                }
                // safety: node is on one of our free lists
                node = unsafe { (*node).next };
            }
        }
        seen.len()
    }
}

impl<P: Platform> Drop for PoolAllocator<P> {
    fn drop(&mut self) {
        let trace_span = tracing::span!(Level::TRACE, "pool::drop", heap_size = self.heap_size);
        let _span_enter = trace_span.enter();

        self.free_lists = [ptr::null_mut(); NUM_CLASSES];
        self.arena = Arena::EMPTY;
        for (block, bytes) in mem::take(&mut self.owned_arenas) {
            tracing::event!(Level::TRACE, block = ?UsizePtr::from(block), bytes, "releasing arena");
            // safety: every owned arena came from this platform with this size,
            // and pool blocks may not outlive the pool
            unsafe { self.system.platform_mut().free(block, bytes) };
        }
    }
}

impl<P: Platform> RawAlloc for PoolAllocator<P> {
    fn allocate(&mut self, bytes: usize) -> Result<Option<NonNull<u8>>, AllocError> {
        PoolAllocator::allocate(self, bytes)
    }

    unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>, bytes: usize) {
        PoolAllocator::deallocate(self, ptr, bytes)
    }

    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        PoolAllocator::reallocate(self, ptr, old_bytes, new_bytes)
    }
}
