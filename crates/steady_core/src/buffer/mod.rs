//! Self-expanding host array
//!
//! The host keeps a fixed-size static array and addresses it from many places
//! in its code. [`GrowableBuffer`] sits in front of the host's "reserve next
//! slot" routine: when the host's own count reaches capacity the array is
//! moved into a block twice the size and every registered [`DependentSite`]
//! is rewritten to the new base, end and capacity before the host writes the
//! slot it asked for.

mod allocator;
mod sites;
mod storage;

pub use allocator::{BlockAllocator, OwnedBlock, SystemAllocator};
pub use sites::{DependentSite, SiteKind, SiteRegistry};
pub use storage::Storage;

use crate::host::HostCell;
use std::alloc::Layout;
use std::ptr::{self, NonNull};
use steady_env::{MemoryProtector, ProtectError, SystemProtector};
use thiserror::Error;

/// Capacity multiplier applied on every overflow.
pub const GROWTH_FACTOR: usize = 2;

/// Shape of the host array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Bytes per slot.
    pub stride: usize,
    /// Alignment of owned storage; power of two.
    pub align: usize,
    /// Slot count of the host's original array.
    pub initial_capacity: usize,
    /// Growth past this many slots is refused like a failed allocation.
    pub max_capacity: Option<usize>,
}

impl BufferLayout {
    pub fn new(stride: usize, initial_capacity: usize) -> Self {
        Self {
            stride,
            align: std::mem::align_of::<usize>(),
            initial_capacity,
            max_capacity: None,
        }
    }

    pub fn with_align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    pub fn with_max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = Some(max_capacity);
        self
    }

    pub fn validate(&self) -> Result<(), BufferError> {
        if self.stride == 0 {
            return Err(BufferError::InvalidLayout { reason: "stride must be non-zero" });
        }
        if self.initial_capacity == 0 {
            return Err(BufferError::InvalidLayout { reason: "initial capacity must be non-zero" });
        }
        if self.initial_capacity > u32::MAX as usize {
            return Err(BufferError::InvalidLayout { reason: "initial capacity exceeds 32 bits" });
        }
        if !self.align.is_power_of_two() {
            return Err(BufferError::InvalidLayout { reason: "alignment must be a power of two" });
        }
        Ok(())
    }

    fn block_layout(&self, capacity: usize) -> Result<Layout, BufferError> {
        capacity
            .checked_mul(self.stride)
            .and_then(|bytes| Layout::from_size_align(bytes, self.align).ok())
            .ok_or(BufferError::CapacityOverflow { capacity })
    }
}

#[derive(Debug, Error)]
pub enum BufferError {
    #[error("invalid buffer layout: {reason}")]
    InvalidLayout { reason: &'static str },

    #[error("{kind:?} site at {address:#x} holds {found:#x}, expected {expected:#x}")]
    SiteMismatch {
        kind: SiteKind,
        address: usize,
        found: usize,
        expected: usize,
    },

    #[error("cannot grow a buffer of {capacity} slots any further")]
    CapacityOverflow { capacity: usize },

    #[error("growth to {requested} slots exceeds the limit of {limit}")]
    CapacityLimit { requested: usize, limit: usize },

    #[error("allocation of {bytes} bytes failed")]
    AllocationFailed { bytes: usize },

    #[error("growth is disabled after an earlier failure")]
    GrowthDisabled,

    #[error(transparent)]
    Protection(#[from] ProtectError),
}

/// Replacement storage for one host array.
pub struct GrowableBuffer<A: BlockAllocator = SystemAllocator, P: MemoryProtector = SystemProtector> {
    layout: BufferLayout,
    storage: Storage<A>,
    capacity: usize,
    logical_count: HostCell<u32>,
    sites: SiteRegistry,
    allocator: A,
    protector: P,
    growth_disabled: bool,
    growths: u32,
}

impl<A: BlockAllocator, P: MemoryProtector> GrowableBuffer<A, P> {
    /// Take over the host array at `alias`.
    ///
    /// Every site must currently agree with `alias` and the initial capacity;
    /// a disagreeing site means the installer resolved the wrong address.
    ///
    /// # Safety
    ///
    /// - `alias` must stay valid for reads of `initial_capacity * stride` bytes
    ///   for the life of the buffer.
    /// - Every site address must be readable, and writable once unlocked by
    ///   `protector`, for the life of the buffer.
    pub unsafe fn new(
        layout: BufferLayout,
        alias: NonNull<u8>,
        logical_count: HostCell<u32>,
        sites: SiteRegistry,
        allocator: A,
        protector: P,
    ) -> Result<Self, BufferError> {
        layout.validate()?;
        if let Some((site, found)) =
            sites.find_stale(alias.as_ptr() as usize, layout.initial_capacity, layout.stride)
        {
            return Err(BufferError::SiteMismatch {
                kind: site.kind,
                address: site.address,
                found,
                expected: site.expected(alias.as_ptr() as usize, layout.initial_capacity, layout.stride),
            });
        }

        tracing::debug!(
            base = ?alias,
            capacity = layout.initial_capacity,
            stride = layout.stride,
            sites = sites.len(),
            "buffer aliasing host array"
        );

        Ok(Self {
            layout,
            storage: Storage::Alias(alias),
            capacity: layout.initial_capacity,
            logical_count,
            sites,
            allocator,
            protector,
            growth_disabled: false,
            growths: 0,
        })
    }

    /// Stand-in for the host's slot reservation routine.
    ///
    /// Grows first if the host's count has reached capacity, then runs the
    /// host's original routine and returns its result unchanged. A failed
    /// growth is logged and disables further attempts; the host then sees its
    /// original fixed limit.
    pub fn intercept_allocate<R>(&mut self, original: impl FnOnce() -> R) -> R {
        let count = self.logical_count.get() as usize;
        if count >= self.capacity && !self.growth_disabled {
            if let Err(err) = self.grow() {
                tracing::warn!(%err, capacity = self.capacity, "buffer growth failed, capacity is now fixed");
                self.growth_disabled = true;
            }
        }
        original()
    }

    /// Double capacity, relocate, and repoint every dependent site.
    ///
    /// On error nothing has changed: not the storage, not the capacity, not a
    /// single site.
    pub fn grow(&mut self) -> Result<(), BufferError> {
        if self.growth_disabled {
            return Err(BufferError::GrowthDisabled);
        }

        let stride = self.layout.stride;
        let new_capacity = self
            .capacity
            .checked_mul(GROWTH_FACTOR)
            .filter(|&c| c <= u32::MAX as usize)
            .ok_or(BufferError::CapacityOverflow { capacity: self.capacity })?;
        if let Some(limit) = self.layout.max_capacity {
            if new_capacity > limit {
                return Err(BufferError::CapacityLimit { requested: new_capacity, limit });
            }
        }

        let block_layout = self.layout.block_layout(new_capacity)?;
        let block = OwnedBlock::allocate(&self.allocator, block_layout).ok_or(
            BufferError::AllocationFailed { bytes: block_layout.size() },
        )?;

        let live_bytes = self.capacity * stride;
        // SAFETY: the source holds `capacity` slots (alias contract or our own
        // block); the new block holds twice that and does not overlap it.
        unsafe {
            ptr::copy_nonoverlapping(self.storage.base().as_ptr(), block.as_ptr(), live_bytes);
            ptr::write_bytes(block.as_ptr().add(live_bytes), 0, block_layout.size() - live_bytes);
        }

        // All sites become writable before anything is committed. If one
        // refuses, `block` is freed and the old storage is still current.
        let guards = self.sites.unlock(&self.protector)?;

        let new_base = block.base();
        let first_move = !self.storage.is_owned();
        let previous = std::mem::replace(&mut self.storage, Storage::Owned(block));
        self.capacity = new_capacity;
        // SAFETY: every site is unlocked by `guards`.
        unsafe { self.sites.write_all(new_base.as_ptr() as usize, new_capacity, stride) };
        drop(guards);
        // Released only after no site refers to it any more.
        drop(previous);

        self.growths += 1;
        tracing::debug!(
            base = ?new_base,
            capacity = new_capacity,
            first_move,
            sites = self.sites.len(),
            "buffer relocated"
        );
        Ok(())
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.storage.base()
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        self.storage.is_owned()
    }

    #[inline]
    pub fn growth_disabled(&self) -> bool {
        self.growth_disabled
    }

    /// Number of successful relocations.
    #[inline]
    pub fn growths(&self) -> u32 {
        self.growths
    }

    /// Bytes of slot `index`, if within capacity.
    pub fn slot(&self, index: usize) -> Option<&[u8]> {
        if index >= self.capacity {
            return None;
        }
        let stride = self.layout.stride;
        // SAFETY: index < capacity and storage holds `capacity` slots.
        Some(unsafe {
            std::slice::from_raw_parts(self.storage.base().as_ptr().add(index * stride), stride)
        })
    }
}
