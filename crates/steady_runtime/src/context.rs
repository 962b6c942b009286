//! The installed patch state
//!
//! One `PatchContext` is built by [`PatchContext::install`] and then owned by
//! the hook layer for the rest of the process. Each feature is installed
//! independently: a feature that cannot be resolved or hooked is skipped and
//! the host keeps its original behaviour for it.

use crate::error::InstallError;
use crate::hooks;
use crate::patcher::{HookRequest, Patcher};
use crate::settings::Settings;
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use steady_core::buffer::{BufferLayout, GrowableBuffer, SiteRegistry, SystemAllocator};
use steady_core::host::HostCell;
use steady_core::time::{ClockConfig, ClockTargets, FrameClock};
use steady_env::{MemoryProtector, PerformanceCounter, SystemProtector};

/// Signature of the host's slot reservation routine.
pub type OriginalAllocate = unsafe extern "system" fn(size: u32, flags: u32) -> *mut c_void;

/// Which features ended up installed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstallReport {
    pub timers: bool,
    pub buffer: bool,
}

pub struct PatchContext<P: MemoryProtector = SystemProtector> {
    clock: Option<FrameClock<PerformanceCounter>>,
    buffer: Option<GrowableBuffer<SystemAllocator, P>>,
    original_allocate: Option<OriginalAllocate>,
}

impl<P: MemoryProtector + Default> PatchContext<P> {
    /// Resolve, hook and construct every feature enabled in `settings`.
    pub fn install(patcher: &mut impl Patcher, settings: &Settings) -> Self {
        let mut ctx = Self::empty();

        if let Err(err) = settings.validate() {
            tracing::warn!(%err, "settings rejected, nothing installed");
            return ctx;
        }

        if settings.timers.enabled {
            match ctx.install_clock(patcher, settings) {
                Ok(()) => tracing::info!("frame clock installed"),
                Err(err) => tracing::warn!(%err, "frame clock not installed"),
            }
        } else {
            tracing::info!("frame clock disabled in settings");
        }

        if settings.buffer.enabled {
            match ctx.install_buffer(patcher, settings) {
                Ok(()) => tracing::info!(
                    capacity = settings.buffer.initial_capacity,
                    "growable buffer installed"
                ),
                Err(err) => tracing::warn!(%err, "growable buffer not installed"),
            }
        } else {
            tracing::info!("growable buffer disabled in settings");
        }

        ctx
    }

    fn install_clock(&mut self, patcher: &mut impl Patcher, settings: &Settings) -> Result<(), InstallError> {
        let addresses = patcher.resolve_clock()?;
        // SAFETY: the patcher resolved these as the host's timing globals.
        let targets = unsafe {
            ClockTargets {
                tick_delta: host_cell(addresses.tick_delta, "tick delta")?,
                current_time: host_cell(addresses.current_time, "current time")?,
                window_active: host_cell(addresses.window_active, "window active flag")?,
            }
        };

        patcher.install_hooks(&[
            HookRequest::new(addresses.init_timers, hooks::init_timers as usize),
            HookRequest::new(addresses.tick_timers, hooks::tick_timers as usize),
            HookRequest::new(addresses.wait_timer, hooks::wait_timer as usize),
        ])?;

        self.clock = Some(FrameClock::new(
            PerformanceCounter::new(),
            ClockConfig::from(&settings.timers),
            targets,
        ));
        Ok(())
    }

    fn install_buffer(&mut self, patcher: &mut impl Patcher, settings: &Settings) -> Result<(), InstallError> {
        let addresses = patcher.resolve_buffer()?;
        if addresses.allocate_slot == 0 {
            return Err(InstallError::NullAddress { what: "slot allocator" });
        }
        let array = NonNull::new(addresses.array as *mut u8)
            .ok_or(InstallError::NullAddress { what: "slot array" })?;
        // SAFETY: the patcher resolved this as the host's entry count.
        let count = unsafe { host_cell::<u32>(addresses.logical_count, "slot count")? };
        let sites: SiteRegistry = addresses.sites.iter().copied().collect();

        // SAFETY: the array and every site were resolved in the host image,
        // which stays mapped for the life of the process.
        let buffer = unsafe {
            GrowableBuffer::new(
                BufferLayout::from(&settings.buffer),
                array,
                count,
                sites,
                SystemAllocator,
                P::default(),
            )?
        };

        let originals =
            patcher.install_hooks(&[HookRequest::new(addresses.allocate_slot, hooks::allocate_slot as usize)])?;
        let original = originals
            .first()
            .copied()
            .filter(|&address| address != 0)
            .ok_or(InstallError::NullAddress { what: "original slot allocator" })?;

        // SAFETY: the patcher returns an entry point with the host routine's signature.
        self.original_allocate = Some(unsafe { std::mem::transmute::<usize, OriginalAllocate>(original) });
        self.buffer = Some(buffer);
        Ok(())
    }
}

impl<P: MemoryProtector> PatchContext<P> {
    /// A context with nothing installed.
    pub fn empty() -> Self {
        Self {
            clock: None,
            buffer: None,
            original_allocate: None,
        }
    }

    pub fn report(&self) -> InstallReport {
        InstallReport {
            timers: self.clock.is_some(),
            buffer: self.buffer.is_some(),
        }
    }

    pub fn initialize_timers(&mut self) {
        if let Some(clock) = self.clock.as_mut() {
            clock.initialize();
        }
    }

    pub fn tick_timers(&mut self) {
        if let Some(clock) = self.clock.as_mut() {
            clock.advance();
        }
    }

    pub fn wait_timer(&self, duration: i32) {
        if let Some(clock) = self.clock.as_ref() {
            clock.wait_until(duration);
        }
    }

    /// Grow if needed, then run the host's own routine.
    pub fn allocate_slot(&mut self, size: u32, flags: u32) -> *mut c_void {
        let Some(original) = self.original_allocate else {
            return ptr::null_mut();
        };
        // SAFETY: `original` is the host's routine; arguments are passed through untouched.
        let call = || unsafe { original(size, flags) };
        match self.buffer.as_mut() {
            Some(buffer) => buffer.intercept_allocate(call),
            None => call(),
        }
    }

    pub fn clock(&self) -> Option<&FrameClock<PerformanceCounter>> {
        self.clock.as_ref()
    }

    pub fn buffer(&self) -> Option<&GrowableBuffer<SystemAllocator, P>> {
        self.buffer.as_ref()
    }
}

/// # Safety
///
/// A non-null `address` must be a valid, aligned, process-lifetime `T`.
unsafe fn host_cell<T: Copy>(address: usize, what: &'static str) -> Result<HostCell<T>, InstallError> {
    HostCell::from_raw(address as *mut T).ok_or(InstallError::NullAddress { what })
}
