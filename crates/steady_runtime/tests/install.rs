use std::ffi::c_void;
use steady_core::buffer::DependentSite;
use steady_core::host::HostCell;
use steady_core::time::RESET_DELTA;
use steady_env::NoProtection;
use steady_runtime::{
    hooks, BufferAddresses, ClockAddresses, HookRequest, PatchContext, PatchError, Patcher, Settings,
};

const ALLOCATE_TARGET: usize = 0x4000;

/// Echoes its arguments so pass-through can be checked.
extern "system" fn original_allocate(size: u32, flags: u32) -> *mut c_void {
    ((size as usize) << 8 | flags as usize) as *mut c_void
}

struct Host {
    tick_delta: HostCell<i32>,
    current_time: HostCell<i32>,
    window_active: HostCell<u8>,
    count: HostCell<u32>,
    array: usize,
    base_site: HostCell<usize>,
    capacity_site: HostCell<u32>,
}

impl Host {
    fn new(capacity: usize) -> Self {
        let array = Box::leak(vec![0u32; capacity].into_boxed_slice()).as_mut_ptr() as usize;
        Self {
            tick_delta: HostCell::leak(0),
            current_time: HostCell::leak(777),
            window_active: HostCell::leak(1),
            count: HostCell::leak(0),
            array,
            base_site: HostCell::leak(array),
            capacity_site: HostCell::leak(capacity as u32),
        }
    }
}

#[derive(Default)]
struct Failures {
    clock_missing: bool,
    buffer_missing: bool,
    refuse_hooks_at: Option<usize>,
}

struct FakePatcher<'a> {
    host: &'a Host,
    failures: Failures,
    installed: Vec<HookRequest>,
}

impl<'a> FakePatcher<'a> {
    fn new(host: &'a Host) -> Self {
        Self::failing(host, Failures::default())
    }

    fn failing(host: &'a Host, failures: Failures) -> Self {
        Self {
            host,
            failures,
            installed: Vec::new(),
        }
    }
}

impl Patcher for FakePatcher<'_> {
    fn resolve_clock(&mut self) -> Result<ClockAddresses, PatchError> {
        if self.failures.clock_missing {
            return Err(PatchError::NotFound { what: "tick timers" });
        }
        Ok(ClockAddresses {
            init_timers: 0x1000,
            tick_timers: 0x2000,
            wait_timer: 0x3000,
            tick_delta: self.host.tick_delta.as_ptr() as usize,
            current_time: self.host.current_time.as_ptr() as usize,
            window_active: self.host.window_active.as_ptr() as usize,
        })
    }

    fn resolve_buffer(&mut self) -> Result<BufferAddresses, PatchError> {
        if self.failures.buffer_missing {
            return Err(PatchError::NotFound { what: "slot allocator" });
        }
        Ok(BufferAddresses {
            allocate_slot: ALLOCATE_TARGET,
            array: self.host.array,
            logical_count: self.host.count.as_ptr() as usize,
            sites: vec![
                DependentSite::base(self.host.base_site.as_ptr() as usize),
                DependentSite::capacity(self.host.capacity_site.as_ptr() as usize),
            ],
        })
    }

    fn install_hooks(&mut self, hooks: &[HookRequest]) -> Result<Vec<usize>, PatchError> {
        if let Some(target) = self.failures.refuse_hooks_at {
            if hooks.iter().any(|h| h.target == target) {
                return Err(PatchError::HookFailed {
                    target,
                    reason: "page not writable".to_string(),
                });
            }
        }
        self.installed.extend_from_slice(hooks);
        Ok(hooks
            .iter()
            .map(|h| if h.target == ALLOCATE_TARGET { original_allocate as usize } else { h.target })
            .collect())
    }
}

fn settings(initial_capacity: usize) -> Settings {
    let mut settings = Settings::default();
    settings.buffer.initial_capacity = initial_capacity;
    settings
}

#[test]
fn installs_both_features_and_redirects_four_entry_points() {
    let host = Host::new(8);
    let mut patcher = FakePatcher::new(&host);
    let ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings(8));

    assert!(ctx.report().timers);
    assert!(ctx.report().buffer);
    let targets: Vec<usize> = patcher.installed.iter().map(|h| h.target).collect();
    assert_eq!(targets, vec![0x1000, 0x2000, 0x3000, ALLOCATE_TARGET]);
    assert!(patcher.installed.iter().all(|h| h.replacement != 0));
    // Installing initializes the clock, which clears the host's running total.
    assert_eq!(host.current_time.get(), 0);
}

#[test]
fn first_tick_after_install_reports_reset_delta() {
    let host = Host::new(8);
    let mut patcher = FakePatcher::new(&host);
    let mut ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings(8));

    ctx.initialize_timers();
    ctx.tick_timers();
    assert_eq!(host.tick_delta.get(), RESET_DELTA);
    assert_eq!(host.current_time.get(), RESET_DELTA);

    host.window_active.set(0);
    ctx.tick_timers();
    assert_eq!(host.tick_delta.get(), 0);
    assert_eq!(host.current_time.get(), RESET_DELTA);
}

#[test]
fn allocation_passes_through_and_grows_on_overflow() {
    let host = Host::new(4);
    let mut patcher = FakePatcher::new(&host);
    let mut ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings(4));

    for _ in 0..4 {
        let result = ctx.allocate_slot(4, 3);
        assert_eq!(result as usize, 4 << 8 | 3);
        host.count.set(host.count.get() + 1);
    }
    assert_eq!(ctx.buffer().map(|b| b.capacity()), Some(4));

    ctx.allocate_slot(4, 0);
    let buffer = ctx.buffer().unwrap();
    assert_eq!(buffer.capacity(), 8);
    assert_eq!(host.base_site.get(), buffer.base().as_ptr() as usize);
    assert_eq!(host.capacity_site.get(), 8);
}

#[test]
fn missing_clock_pattern_still_installs_buffer() {
    let host = Host::new(8);
    let failures = Failures {
        clock_missing: true,
        ..Default::default()
    };
    let mut patcher = FakePatcher::failing(&host, failures);
    let ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings(8));

    assert!(!ctx.report().timers);
    assert!(ctx.report().buffer);
    assert_eq!(host.current_time.get(), 777);
}

#[test]
fn refused_hook_skips_only_that_feature() {
    let host = Host::new(8);
    let failures = Failures {
        refuse_hooks_at: Some(0x2000),
        ..Default::default()
    };
    let mut patcher = FakePatcher::failing(&host, failures);
    let ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings(8));

    assert!(!ctx.report().timers);
    assert!(ctx.report().buffer);
    assert_eq!(patcher.installed.len(), 1);
    // Clock never constructed, so host time untouched.
    assert_eq!(host.current_time.get(), 777);
}

#[test]
fn wrong_initial_capacity_is_caught_by_site_check() {
    let host = Host::new(8);
    let mut patcher = FakePatcher::new(&host);
    let ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings(16));

    assert!(ctx.report().timers);
    assert!(!ctx.report().buffer);
    assert_eq!(patcher.installed.len(), 3);
}

#[test]
fn disabled_features_are_not_touched() {
    let host = Host::new(8);
    let mut patcher = FakePatcher::new(&host);
    let mut settings = settings(8);
    settings.timers.enabled = false;
    settings.buffer.enabled = false;
    let mut ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings);

    assert_eq!(ctx.report(), Default::default());
    assert!(patcher.installed.is_empty());
    assert!(ctx.allocate_slot(1, 1).is_null());
}

#[test]
fn rejected_settings_install_nothing() {
    let host = Host::new(8);
    let mut patcher = FakePatcher::new(&host);
    let mut settings = settings(8);
    settings.buffer.stride = 0;
    let ctx = PatchContext::<NoProtection>::install(&mut patcher, &settings);

    assert_eq!(ctx.report(), Default::default());
    assert!(patcher.installed.is_empty());
    assert_eq!(host.current_time.get(), 777);
}

#[test]
fn entry_points_are_inert_until_bound_then_drive_the_context() {
    let host = Host::new(8);
    assert!(!hooks::is_bound());
    hooks::tick_timers();
    assert_eq!(host.tick_delta.get(), 0);
    assert!(hooks::allocate_slot(1, 2).is_null());

    let mut patcher = FakePatcher::failing(
        &host,
        Failures {
            buffer_missing: true,
            ..Default::default()
        },
    );
    let report = steady_runtime::install(&mut patcher, &settings(8));
    assert!(report.timers && !report.buffer);
    assert!(hooks::is_bound());

    hooks::init_timers();
    hooks::tick_timers();
    assert_eq!(host.tick_delta.get(), RESET_DELTA);
    hooks::wait_timer(-1);
}
