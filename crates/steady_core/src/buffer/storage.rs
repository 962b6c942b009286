//! Where the slots currently live

use super::allocator::{BlockAllocator, OwnedBlock};
use std::ptr::NonNull;

/// Buffer storage: the host's original array until the first growth, an
/// owned block from then on. Never goes back to `Alias`.
pub enum Storage<A: BlockAllocator> {
    /// The host's static array. Not ours to free.
    Alias(NonNull<u8>),
    Owned(OwnedBlock<A>),
}

impl<A: BlockAllocator> Storage<A> {
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        match self {
            Storage::Alias(ptr) => *ptr,
            Storage::Owned(block) => block.base(),
        }
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self, Storage::Owned(_))
    }
}

impl<A: BlockAllocator> std::fmt::Debug for Storage<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Alias(ptr) => write!(f, "Alias({:p})", ptr),
            Storage::Owned(block) => write!(f, "Owned({:p}, {} bytes)", block.base(), block.len()),
        }
    }
}
