//! Debug-build detection of caller contract violations
//!
//! Release builds trust the caller completely. Debug builds remember the size
//! class of every pool block that is handed out, and fill the body of every
//! free block with [POISON] so that writes after free can be noticed when the
//! block is handed out again.

use std::{ptr::NonNull, slice};

use rustc_hash::FxHashMap;

use super::{class_size, FREE_NODE_SZ};
use crate::util::UsizePtr;

/// Fill byte for the unused part of free blocks
pub(super) const POISON: u8 = 0xdb;

/// Size class of every pool block currently owned by a caller
#[derive(Debug, Default)]
pub(super) struct ContractChecks {
    live: FxHashMap<usize, usize>,
}

impl ContractChecks {
    pub(super) fn mark_live(&mut self, block: NonNull<u8>, class: usize) {
        if let Some(prev_class) = self.live.insert(block.as_ptr() as usize, class) {
            panic!(
                "Block {:?} handed out twice (class {} and class {})!",
                UsizePtr::from(block),
                prev_class,
                class
            );
        }
    }

    pub(super) fn mark_free(&mut self, block: NonNull<u8>, class: usize) {
        match self.live.remove(&(block.as_ptr() as usize)) {
            Some(live_class) if live_class == class => {}
            Some(live_class) => panic!(
                "Size mismatch on deallocate: block {:?} is {} bytes but was freed as {} bytes",
                UsizePtr::from(block),
                class_size(live_class),
                class_size(class)
            ),
            None => panic!(
                "Block {:?} is not live (double free or foreign pointer)",
                UsizePtr::from(block)
            ),
        }
    }

    /// A pool block freed with a size above the ceiling would be handed to
    /// the platform, which never saw it
    pub(super) fn assert_not_pool_block(&self, block: NonNull<u8>, size: usize) {
        if let Some(&class) = self.live.get(&(block.as_ptr() as usize)) {
            panic!(
                "Size mismatch on deallocate: block {:?} is {} bytes but was freed as {} bytes",
                UsizePtr::from(block),
                class_size(class),
                size
            );
        }
    }
}

/// Fill everything after the free-list link with [POISON]
///
/// # Safety
/// `block` must be a free block of `size` bytes.
pub(super) unsafe fn poison(block: NonNull<u8>, size: usize) {
    let body = block.as_ptr().add(FREE_NODE_SZ);
    body.write_bytes(POISON, size - FREE_NODE_SZ);
}

/// Check that a free block's body still holds [POISON]
///
/// # Safety
/// `block` must be a free block of `size` bytes that was passed to [poison].
pub(super) unsafe fn verify_poison(block: NonNull<u8>, size: usize) {
    let body = slice::from_raw_parts(block.as_ptr().add(FREE_NODE_SZ), size - FREE_NODE_SZ);
    if let Some(offs) = body.iter().position(|&b| b != POISON) {
        panic!(
            "Write after free detected in block {:?} at offset {}",
            UsizePtr::from(block),
            offs + FREE_NODE_SZ
        );
    }
}
