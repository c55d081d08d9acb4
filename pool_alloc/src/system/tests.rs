use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::test_platform::BudgetPlatform;

use super::*;

fn assert_send<T: Send>() {}

#[test]
fn ensure_system_allocator_send() {
    assert_send::<SystemAllocator>();
    assert_send::<SystemAllocator<BudgetPlatform>>();
}

#[test]
fn zero_bytes_is_empty_not_error() {
    let mut sys = SystemAllocator::new();
    assert_eq!(sys.allocate(0), Ok(None));
}

#[test]
fn null_pointer_ops_are_noops() {
    let platform = BudgetPlatform::unlimited();
    let mut sys = SystemAllocator::with_platform(platform.clone());
    unsafe {
        assert_eq!(sys.reallocate(None, 16, 32), Ok(None));
        sys.deallocate(None, 16);
    }
    assert_eq!(platform.alloc_calls(), 0);
    assert_eq!(platform.realloc_calls(), 0);
    assert_eq!(platform.free_calls(), 0);
}

#[cfg(not(loom))]
#[test]
fn allocate_write_free() {
    let mut sys = SystemAllocator::new();
    let p = sys.allocate(1000).unwrap().unwrap();
    assert_eq!(p.as_ptr() as usize % WORD_ALIGN, 0);
    unsafe {
        std::ptr::write_bytes(p.as_ptr(), 0xab, 1000);
        assert_eq!(*p.as_ptr().add(999), 0xab);
        sys.deallocate(Some(p), 1000);
    }
}

#[cfg(not(loom))]
#[test]
fn reallocate_preserves_contents() {
    let platform = BudgetPlatform::unlimited();
    let mut sys = SystemAllocator::with_platform(platform.clone());
    let p = sys.allocate(200).unwrap().unwrap();
    unsafe {
        for i in 0..200 {
            *p.as_ptr().add(i) = i as u8;
        }
        let q = sys.reallocate(Some(p), 200, 4000).unwrap().unwrap();
        for i in 0..200 {
            assert_eq!(*q.as_ptr().add(i), i as u8);
        }
        assert_eq!(platform.outstanding(), 4000);
        let r = sys.reallocate(Some(q), 4000, 50).unwrap().unwrap();
        for i in 0..50 {
            assert_eq!(*r.as_ptr().add(i), i as u8);
        }
        assert_eq!(platform.outstanding(), 50);
        sys.deallocate(Some(r), 50);
    }
    assert_eq!(platform.outstanding(), 0);
}

#[test]
fn reallocate_to_zero_releases() {
    let platform = BudgetPlatform::unlimited();
    let mut sys = SystemAllocator::with_platform(platform.clone());
    let p = sys.allocate(64).unwrap();
    assert_eq!(unsafe { sys.reallocate(p, 64, 0) }, Ok(None));
    assert_eq!(platform.outstanding(), 0);
    assert_eq!(platform.free_calls(), 1);
}

#[test]
fn no_handler_fails_immediately() {
    let platform = BudgetPlatform::with_budget(100);
    let mut sys = SystemAllocator::with_platform(platform.clone());
    assert!(!sys.has_oom_handler());
    assert_eq!(
        sys.allocate(101),
        Err(AllocError::OutOfMemory { requested: 101 })
    );
    // one attempt, no retries
    assert_eq!(platform.alloc_calls(), 1);
    assert_eq!(sys.oom_invocations(), 0);
}

#[test]
fn failed_reallocate_keeps_original() {
    let platform = BudgetPlatform::with_budget(100);
    let mut sys = SystemAllocator::with_platform(platform.clone());
    let p = sys.allocate(64).unwrap().unwrap();
    unsafe {
        *p.as_ptr() = 0x5a;
        assert_eq!(
            sys.reallocate(Some(p), 64, 1000),
            Err(AllocError::OutOfMemory { requested: 1000 })
        );
        assert_eq!(*p.as_ptr(), 0x5a);
        assert_eq!(platform.outstanding(), 64);
        sys.deallocate(Some(p), 64);
    }
}

#[test]
fn handler_frees_block_then_retry_succeeds() {
    let platform = BudgetPlatform::with_budget(100);
    let mut sys = SystemAllocator::with_platform(platform.clone());

    let victim = sys.allocate(64).unwrap().unwrap();
    assert_eq!(platform.remaining(), 36);

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let mut handler_platform = platform.clone();
    // stored as an address so that the handler stays Send
    let mut victim_addr = Some(victim.as_ptr() as usize);
    let prev = sys.set_oom_handler(Some(Box::new(move || {
        handler_calls.fetch_add(1, Ordering::SeqCst);
        match victim_addr.take() {
            Some(addr) => {
                let ptr = NonNull::new(addr as *mut u8).unwrap();
                unsafe { handler_platform.free(ptr, 64) };
                Ok(())
            }
            None => Err(Unrecoverable),
        }
    })));
    assert!(prev.is_none());

    let p = sys.allocate(80).unwrap().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sys.oom_invocations(), 1);
    assert_eq!(platform.outstanding(), 80);

    // nothing left for the handler to free
    assert_eq!(
        sys.allocate(80),
        Err(AllocError::OutOfMemory { requested: 80 })
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    unsafe { sys.deallocate(Some(p), 80) };
}

#[test]
fn handler_retries_until_progress() {
    let platform = BudgetPlatform::with_budget(0);
    let mut sys = SystemAllocator::with_platform(platform.clone());

    let calls = Arc::new(AtomicUsize::new(0));
    let handler_calls = calls.clone();
    let handler_platform = platform.clone();
    sys.set_oom_handler(Some(Box::new(move || {
        // only the third call actually makes room
        if handler_calls.fetch_add(1, Ordering::SeqCst) == 2 {
            handler_platform.set_remaining(256);
        }
        Ok(())
    })));

    let p = sys.allocate(128).unwrap();
    assert!(p.is_some());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // first attempt plus one retry per handler call
    assert_eq!(platform.alloc_calls(), 4);
    unsafe { sys.deallocate(p, 128) };
}

#[test]
fn set_oom_handler_returns_previous() {
    let mut sys = SystemAllocator::new();
    let which = Arc::new(Mutex::new(Vec::new()));

    let w = which.clone();
    assert!(sys
        .set_oom_handler(Some(Box::new(move || {
            w.lock().unwrap().push(1);
            Err(Unrecoverable)
        })))
        .is_none());

    let w = which.clone();
    let mut first = sys
        .set_oom_handler(Some(Box::new(move || {
            w.lock().unwrap().push(2);
            Err(Unrecoverable)
        })))
        .expect("first handler should come back");
    assert_eq!(first(), Err(Unrecoverable));
    assert_eq!(*which.lock().unwrap(), vec![1]);

    let mut second = sys.set_oom_handler(None).unwrap();
    assert_eq!(second(), Err(Unrecoverable));
    assert_eq!(*which.lock().unwrap(), vec![1, 2]);
    assert!(!sys.has_oom_handler());
}

#[test]
fn reallocate_uses_oom_loop() {
    let platform = BudgetPlatform::with_budget(64);
    let mut sys = SystemAllocator::with_platform(platform.clone());
    let p = sys.allocate(64).unwrap();

    let handler_platform = platform.clone();
    sys.set_oom_handler(Some(Box::new(move || {
        handler_platform.set_remaining(1024);
        Ok(())
    })));

    let q = unsafe { sys.reallocate(p, 64, 512) }.unwrap();
    assert!(q.is_some());
    assert_eq!(sys.oom_invocations(), 1);
    assert_eq!(platform.outstanding(), 512);
    unsafe { sys.deallocate(q, 512) };
}
