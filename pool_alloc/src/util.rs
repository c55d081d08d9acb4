use std::{fmt, ptr::NonNull};

/// Divide, rounding up
pub const fn divroundup(num: usize, divisor: usize) -> usize {
    (num + divisor - 1) / divisor
}

/// Round `num` up to the next multiple of `multiple`
pub const fn roundto(num: usize, multiple: usize) -> usize {
    divroundup(num, multiple) * multiple
}

/// Address wrapper that prints as hex inside tracing fields
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsizePtr(usize);

impl<T: ?Sized> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as *const () as usize)
    }
}

impl<T: ?Sized> From<NonNull<T>> for UsizePtr {
    fn from(value: NonNull<T>) -> Self {
        Self(value.as_ptr() as *const () as usize)
    }
}

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}
