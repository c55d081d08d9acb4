//! Untyped allocation interface shared by both tiers
//!
//! Containers and other collaborators only ever talk to an allocator through
//! these three calls, so they can be written once and handed either a
//! [SystemAllocator](crate::system::SystemAllocator) or a
//! [PoolAllocator](crate::pool::PoolAllocator).

use std::{mem, ptr::NonNull};

use crate::{error::AllocError, system::WORD_ALIGN};

/// Byte-sized allocation interface
///
/// Every block must be returned with the same byte count it was allocated
/// with. Pointers are `None` for empty (zero-byte) blocks.
pub trait RawAlloc {
    /// Allocate `bytes` bytes aligned to [WORD_ALIGN]
    fn allocate(&mut self, bytes: usize) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Return a block
    ///
    /// # Safety
    /// `ptr` must have come from this allocator with a size of `bytes`
    /// and must not be used afterwards.
    unsafe fn deallocate(&mut self, ptr: Option<NonNull<u8>>, bytes: usize);

    /// Resize a block, possibly moving it
    ///
    /// # Safety
    /// `ptr` must have come from this allocator with a size of `old_bytes`.
    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError>;

    /// Allocate uninitialized storage for `count` values of `T`
    fn allocate_array<T>(&mut self, count: usize) -> Result<Option<NonNull<T>>, AllocError>
    where
        Self: Sized,
    {
        let bytes = array_bytes::<T>(count)?;
        Ok(self.allocate(bytes)?.map(NonNull::cast))
    }

    /// Return storage obtained from [allocate_array](Self::allocate_array)
    ///
    /// # Safety
    /// Same as [deallocate](Self::deallocate), with `count` equal to the
    /// count used at allocation time.
    unsafe fn deallocate_array<T>(&mut self, ptr: Option<NonNull<T>>, count: usize)
    where
        Self: Sized,
    {
        // cannot overflow, the same product was computed at allocation time
        self.deallocate(ptr.map(NonNull::cast), count * mem::size_of::<T>())
    }

    /// Grow or shrink storage obtained from [allocate_array](Self::allocate_array)
    ///
    /// # Safety
    /// Same as [reallocate](Self::reallocate), with `old_count` equal to the
    /// count used at allocation time.
    unsafe fn reallocate_array<T>(
        &mut self,
        ptr: Option<NonNull<T>>,
        old_count: usize,
        new_count: usize,
    ) -> Result<Option<NonNull<T>>, AllocError>
    where
        Self: Sized,
    {
        let new_bytes = array_bytes::<T>(new_count)?;
        let old_bytes = old_count * mem::size_of::<T>();
        Ok(self
            .reallocate(ptr.map(NonNull::cast), old_bytes, new_bytes)?
            .map(NonNull::cast))
    }
}

/// Byte size of `count` values of `T`
pub fn array_bytes<T>(count: usize) -> Result<usize, AllocError> {
    let align = mem::align_of::<T>();
    if align > WORD_ALIGN {
        return Err(AllocError::UnsupportedAlignment { align });
    }
    let elem_size = mem::size_of::<T>();
    count
        .checked_mul(elem_size)
        .ok_or(AllocError::CapacityOverflow { count, elem_size })
}
