//! Backing allocation for owned buffer storage

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Source of raw blocks for relocated storage.
///
/// Failure is reported with `None`, never by aborting: a refused allocation
/// only means the buffer stops growing.
pub trait BlockAllocator: Clone {
    /// Allocate `layout.size()` bytes. Contents are unspecified.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// # Safety
    ///
    /// `ptr` must come from [`BlockAllocator::allocate`] on this allocator
    /// (or a clone of it) with the same `layout`, and must not be used again.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global Rust allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

impl BlockAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: non-zero size checked above.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}

/// A block owned by the buffer, released on drop.
pub struct OwnedBlock<A: BlockAllocator> {
    ptr: NonNull<u8>,
    layout: Layout,
    allocator: A,
}

impl<A: BlockAllocator> OwnedBlock<A> {
    pub fn allocate(allocator: &A, layout: Layout) -> Option<Self> {
        let ptr = allocator.allocate(layout)?;
        Some(Self {
            ptr,
            layout,
            allocator: allocator.clone(),
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl<A: BlockAllocator> Drop for OwnedBlock<A> {
    fn drop(&mut self) {
        // SAFETY: ptr/layout pair came from this allocator in `allocate`.
        unsafe { self.allocator.deallocate(self.ptr, self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_respects_alignment() {
        let layout = Layout::from_size_align(256, 64).unwrap();
        let block = OwnedBlock::allocate(&SystemAllocator, layout).unwrap();
        assert_eq!(block.as_ptr() as usize % 64, 0);
        assert_eq!(block.len(), 256);
    }

    #[test]
    fn zero_sized_requests_are_refused() {
        let layout = Layout::from_size_align(0, 8).unwrap();
        assert!(SystemAllocator.allocate(layout).is_none());
    }
}
