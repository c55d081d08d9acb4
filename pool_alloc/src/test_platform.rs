//! Platform backend with a byte budget, used to force allocation failures

use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::system::{Platform, SystemPlatform};

#[derive(Debug, Default)]
struct BudgetState {
    remaining: AtomicUsize,
    outstanding: AtomicUsize,
    alloc_calls: AtomicUsize,
    realloc_calls: AtomicUsize,
    free_calls: AtomicUsize,
}

/// Hands out real heap memory, but only up to `remaining` bytes
///
/// Clones share the same budget and counters, so a clone captured by an OOM
/// handler can release memory that the allocator under test will then see.
#[derive(Debug, Clone)]
pub struct BudgetPlatform {
    inner: SystemPlatform,
    state: Arc<BudgetState>,
}

impl BudgetPlatform {
    pub fn unlimited() -> Self {
        Self::with_budget(usize::MAX)
    }

    pub fn with_budget(bytes: usize) -> Self {
        let state = BudgetState::default();
        state.remaining.store(bytes, Ordering::SeqCst);
        Self {
            inner: SystemPlatform,
            state: Arc::new(state),
        }
    }

    pub fn remaining(&self) -> usize {
        self.state.remaining.load(Ordering::SeqCst)
    }

    pub fn set_remaining(&self, bytes: usize) {
        self.state.remaining.store(bytes, Ordering::SeqCst);
    }

    /// Bytes currently handed out and not yet freed
    pub fn outstanding(&self) -> usize {
        self.state.outstanding.load(Ordering::SeqCst)
    }

    pub fn alloc_calls(&self) -> usize {
        self.state.alloc_calls.load(Ordering::SeqCst)
    }

    pub fn realloc_calls(&self) -> usize {
        self.state.realloc_calls.load(Ordering::SeqCst)
    }

    pub fn free_calls(&self) -> usize {
        self.state.free_calls.load(Ordering::SeqCst)
    }

    fn take(&self, bytes: usize) -> bool {
        self.state
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(bytes)
            })
            .is_ok()
    }

    fn give_back(&self, bytes: usize) {
        // saturating so that an unlimited budget stays unlimited
        let _ = self
            .state
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                Some(left.saturating_add(bytes))
            });
    }
}

impl Platform for BudgetPlatform {
    fn alloc(&mut self, bytes: usize) -> Option<NonNull<u8>> {
        self.state.alloc_calls.fetch_add(1, Ordering::SeqCst);
        if !self.take(bytes) {
            return None;
        }
        match self.inner.alloc(bytes) {
            Some(ptr) => {
                self.state.outstanding.fetch_add(bytes, Ordering::SeqCst);
                Some(ptr)
            }
            None => {
                self.give_back(bytes);
                None
            }
        }
    }

    unsafe fn realloc(
        &mut self,
        ptr: NonNull<u8>,
        old_bytes: usize,
        new_bytes: usize,
    ) -> Option<NonNull<u8>> {
        self.state.realloc_calls.fetch_add(1, Ordering::SeqCst);
        let growth = new_bytes.saturating_sub(old_bytes);
        if !self.take(growth) {
            return None;
        }
        match self.inner.realloc(ptr, old_bytes, new_bytes) {
            Some(new_ptr) => {
                self.give_back(old_bytes.saturating_sub(new_bytes));
                self.state.outstanding.fetch_sub(old_bytes, Ordering::SeqCst);
                self.state.outstanding.fetch_add(new_bytes, Ordering::SeqCst);
                Some(new_ptr)
            }
            None => {
                self.give_back(growth);
                None
            }
        }
    }

    unsafe fn free(&mut self, ptr: NonNull<u8>, bytes: usize) {
        self.state.free_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.free(ptr, bytes);
        self.state.outstanding.fetch_sub(bytes, Ordering::SeqCst);
        self.give_back(bytes);
    }
}
