//! Frame time accumulator
//!
//! Converts hardware counter ticks into the host's fixed-point tick units
//! (65536 per reference frame, 50 reference frames per second). The integer
//! division remainder is carried from frame to frame, so reported deltas never
//! drift from real time by more than one unit.

use crate::host::HostCell;
use steady_env::HardwareCounter;

/// Host tick units per second of real time.
pub const TICK_SCALE: i64 = 3_276_800;

/// Delta reported by the first advance after (re)initialization: one reference frame.
pub const RESET_DELTA: i32 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockConfig {
    pub tick_scale: i64,
    pub reset_delta: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_scale: TICK_SCALE,
            reset_delta: RESET_DELTA,
        }
    }
}

/// Host locations the clock reads and publishes to.
#[derive(Debug, Clone, Copy)]
pub struct ClockTargets {
    /// Per-frame delta the host reads after every tick.
    pub tick_delta: HostCell<i32>,
    /// Running total the host reads as "current time".
    pub current_time: HostCell<i32>,
    /// Non-zero while the host window is active.
    pub window_active: HostCell<u8>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ClockState {
    frequency: i64,
    last_sample: i64,
    carry: i64,
    accumulated: i64,
    pending_reset: bool,
}

/// Drift-free replacement for the host's tick source.
pub struct FrameClock<C> {
    counter: C,
    config: ClockConfig,
    targets: ClockTargets,
    state: ClockState,
}

impl<C: HardwareCounter> FrameClock<C> {
    /// Build a running clock. Performs an initial [`FrameClock::initialize`].
    pub fn new(counter: C, config: ClockConfig, targets: ClockTargets) -> Self {
        let mut clock = Self {
            counter,
            config,
            targets,
            state: ClockState::default(),
        };
        clock.initialize();
        clock
    }

    /// Resynchronize with the counter.
    ///
    /// Safe to call at any time; the next [`FrameClock::advance`] reports
    /// exactly one reset delta however long the process was suspended.
    pub fn initialize(&mut self) {
        self.state = ClockState {
            frequency: self.counter.frequency().max(1),
            last_sample: self.counter.now(),
            carry: 0,
            accumulated: 0,
            pending_reset: true,
        };
        self.targets.current_time.set(0);
        tracing::debug!(frequency = self.state.frequency, "frame clock initialized");
    }

    /// Advance by one host frame and publish the delta. Returns the delta.
    pub fn advance(&mut self) -> i32 {
        let now = self.counter.now();
        let delta = if self.state.pending_reset {
            self.state.pending_reset = false;
            self.config.reset_delta
        } else if self.targets.window_active.get() == 0 {
            0
        } else {
            self.measure(now)
        };

        self.state.accumulated += i64::from(delta);
        self.state.last_sample = now;

        self.targets.tick_delta.set(delta);
        let total = self.targets.current_time.get();
        self.targets.current_time.set(total.wrapping_add(delta));
        delta
    }

    fn measure(&mut self, now: i64) -> i32 {
        let elapsed = i128::from(now) - i128::from(self.state.last_sample);
        if elapsed < 0 {
            // Counter stepped backwards; time must not.
            tracing::trace!(elapsed = elapsed as i64, "hardware counter went backwards");
            return 0;
        }

        let frequency = i128::from(self.state.frequency);
        let scaled = elapsed * i128::from(self.config.tick_scale) + i128::from(self.state.carry);
        let quotient = scaled.div_euclid(frequency);
        self.state.carry = scaled.rem_euclid(frequency) as i64;
        i32::try_from(quotient).unwrap_or(i32::MAX)
    }

    /// Spin until `duration` tick units have elapsed.
    ///
    /// Deliberately a busy-wait: the host paces frames with sub-millisecond
    /// precision that a sleep cannot give.
    pub fn wait_until(&self, duration: i32) {
        if duration <= 0 {
            return;
        }
        let frequency = i128::from(self.state.frequency);
        let scale = i128::from(self.config.tick_scale);
        let target = i128::from(duration);
        let start = self.counter.now();
        loop {
            let elapsed = (i128::from(self.counter.now()) - i128::from(start)) * scale / frequency;
            if elapsed >= target {
                break;
            }
            std::hint::spin_loop();
        }
    }

    /// Total of every delta reported since the last initialize.
    pub fn accumulated(&self) -> i64 {
        self.state.accumulated
    }

    pub fn carry_remainder(&self) -> i64 {
        self.state.carry
    }

    pub fn is_reset_pending(&self) -> bool {
        self.state.pending_reset
    }
}
