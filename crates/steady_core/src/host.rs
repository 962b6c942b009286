//! Typed views of host memory cells

use std::fmt;
use std::ptr::{self, NonNull};

/// A single value living in the host's data segment.
///
/// Reads and writes are volatile: the host reads these cells from code the
/// compiler cannot see, so no access may be elided or reordered away.
pub struct HostCell<T> {
    ptr: NonNull<T>,
}

impl<T: Copy> HostCell<T> {
    /// Wrap a host address.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be aligned and valid for reads and writes of `T` for as long
    /// as the cell (or any copy of it) is used.
    pub unsafe fn from_raw(ptr: *mut T) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr })
    }

    /// Allocate a fresh cell that lives for the rest of the process.
    ///
    /// Stands in for host globals when no host is present.
    pub fn leak(value: T) -> Self {
        let ptr = NonNull::from(Box::leak(Box::new(value)));
        Self { ptr }
    }

    #[inline]
    pub fn get(&self) -> T {
        // SAFETY: validity guaranteed by the constructor contract.
        unsafe { ptr::read_volatile(self.ptr.as_ptr()) }
    }

    #[inline]
    pub fn set(&self, value: T) {
        // SAFETY: validity guaranteed by the constructor contract.
        unsafe { ptr::write_volatile(self.ptr.as_ptr(), value) }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }
}

impl<T> Clone for HostCell<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for HostCell<T> {}

impl<T> fmt::Debug for HostCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostCell({:p})", self.ptr)
    }
}
