//! Steady Demo
//!
//! Runs the patch against a simulated host: fake timing globals, a fixed
//! slot array with code sites that mirror it, and a patcher that resolves to
//! those locations instead of scanning a real image.

use anyhow::{ensure, Context, Result};
use std::ffi::c_void;
use std::ptr::NonNull;
use steady_core::buffer::DependentSite;
use steady_core::host::HostCell;
use steady_runtime::{
    hooks, logging, BufferAddresses, ClockAddresses, HookRequest, PatchError, Patcher, Settings,
};

/// The host's original slot routine: nothing to initialize in the simulation.
extern "system" fn host_allocate_slot(_size: u32, _flags: u32) -> *mut c_void {
    NonNull::<c_void>::dangling().as_ptr()
}

struct SimulatedHost {
    tick_delta: HostCell<i32>,
    current_time: HostCell<i32>,
    window_active: HostCell<u8>,
    count: HostCell<u32>,
    array: usize,
    base_site: HostCell<usize>,
    end_site: HostCell<usize>,
    capacity_site: HostCell<u32>,
    stride: usize,
}

impl SimulatedHost {
    fn new(stride: usize, capacity: usize) -> Self {
        let array = Box::leak(vec![0u64; (capacity * stride).div_ceil(8)].into_boxed_slice());
        let array = array.as_mut_ptr() as usize;
        Self {
            tick_delta: HostCell::leak(0),
            current_time: HostCell::leak(0),
            window_active: HostCell::leak(1),
            count: HostCell::leak(0),
            array,
            base_site: HostCell::leak(array),
            end_site: HostCell::leak(array + capacity * stride),
            capacity_site: HostCell::leak(capacity as u32),
            stride,
        }
    }

    /// The host's insertion path: reserve, then write through its own pointer.
    fn insert(&self, value: u32) -> bool {
        hooks::allocate_slot(self.stride as u32, 0);
        let index = self.count.get();
        if index >= self.capacity_site.get() {
            return false;
        }
        let slot = (self.base_site.get() + index as usize * self.stride) as *mut u32;
        unsafe { slot.write_unaligned(value) };
        self.count.set(index + 1);
        true
    }
}

struct SimulatedPatcher<'a> {
    host: &'a SimulatedHost,
    hooked: Vec<HookRequest>,
}

impl Patcher for SimulatedPatcher<'_> {
    fn resolve_clock(&mut self) -> Result<ClockAddresses, PatchError> {
        Ok(ClockAddresses {
            init_timers: 0x1000,
            tick_timers: 0x1100,
            wait_timer: 0x1200,
            tick_delta: self.host.tick_delta.as_ptr() as usize,
            current_time: self.host.current_time.as_ptr() as usize,
            window_active: self.host.window_active.as_ptr() as usize,
        })
    }

    fn resolve_buffer(&mut self) -> Result<BufferAddresses, PatchError> {
        Ok(BufferAddresses {
            allocate_slot: 0x2000,
            array: self.host.array,
            logical_count: self.host.count.as_ptr() as usize,
            sites: vec![
                DependentSite::base(self.host.base_site.as_ptr() as usize),
                DependentSite::end(self.host.end_site.as_ptr() as usize),
                DependentSite::capacity(self.host.capacity_site.as_ptr() as usize),
            ],
        })
    }

    fn install_hooks(&mut self, hooks: &[HookRequest]) -> Result<Vec<usize>, PatchError> {
        self.hooked.extend_from_slice(hooks);
        Ok(hooks
            .iter()
            .map(|hook| match hook.target {
                0x2000 => host_allocate_slot as usize,
                other => other,
            })
            .collect())
    }
}

fn main() -> Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(&path).with_context(|| format!("loading {path}"))?,
        None => Settings {
            buffer: steady_runtime::settings::BufferSettings {
                initial_capacity: 64,
                ..Default::default()
            },
            ..Default::default()
        },
    };
    logging::init(&settings.log_level);
    ensure!(settings.buffer.stride >= 4, "the simulated host stores u32 slots");

    let host = SimulatedHost::new(settings.buffer.stride, settings.buffer.initial_capacity);
    let mut patcher = SimulatedPatcher {
        host: &host,
        hooked: Vec::new(),
    };
    let report = steady_runtime::install(&mut patcher, &settings);
    tracing::info!(?report, hooks = patcher.hooked.len(), "installed");

    hooks::init_timers();
    for frame in 0..10 {
        if frame == 6 {
            host.window_active.set(0);
        }
        hooks::tick_timers();
        tracing::info!(
            frame,
            delta = host.tick_delta.get(),
            total = host.current_time.get(),
            "tick"
        );
        hooks::wait_timer(settings.timers.reset_delta / 4);
    }

    let wanted = settings.buffer.initial_capacity * 5;
    let inserted = (0..wanted as u32).take_while(|&v| host.insert(v)).count();
    tracing::info!(
        inserted,
        capacity = host.capacity_site.get(),
        base = host.base_site.get(),
        "slots inserted"
    );

    if report.buffer {
        ensure!(inserted == wanted, "only {inserted} of {wanted} slots fit");
        for index in 0..inserted {
            let slot = (host.base_site.get() + index * host.stride) as *const u32;
            let value = unsafe { slot.read_unaligned() };
            ensure!(value == index as u32, "slot {index} holds {value}");
        }
        ensure!(
            host.end_site.get() == host.base_site.get() + host.capacity_site.get() as usize * host.stride,
            "end site out of sync"
        );
    }
    Ok(())
}
