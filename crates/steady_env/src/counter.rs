// counter.rs
//! Monotonic high-resolution counter.
//!
//! Raw counts are only meaningful relative to each other and to
//! [`HardwareCounter::frequency`]. Some hardware lets the count step backwards
//! across power-state transitions, so consumers must not assume strict
//! monotonicity.

/// A free-running tick source.
pub trait HardwareCounter {
    /// Ticks per second. Always positive.
    fn frequency(&self) -> i64;

    /// Current raw tick count.
    fn now(&self) -> i64;
}

impl<C: HardwareCounter + ?Sized> HardwareCounter for &C {
    #[inline]
    fn frequency(&self) -> i64 {
        (**self).frequency()
    }

    #[inline]
    fn now(&self) -> i64 {
        (**self).now()
    }
}

/// The platform's best monotonic counter.
#[derive(Debug, Default, Clone, Copy)]
pub struct PerformanceCounter;

impl PerformanceCounter {
    pub fn new() -> Self {
        Self
    }
}

impl HardwareCounter for PerformanceCounter {
    #[inline]
    fn frequency(&self) -> i64 {
        query_frequency()
    }

    #[inline]
    fn now(&self) -> i64 {
        query_counter()
    }
}

/* -------------------------- Windows -------------------------- */

#[cfg(target_os = "windows")]
fn query_frequency() -> i64 {
    use windows_sys::Win32::System::Performance::QueryPerformanceFrequency;
    let mut freq = 0i64;
    // Cannot fail on XP and later; keep a sane value if it ever does.
    if unsafe { QueryPerformanceFrequency(&mut freq) } == 0 || freq <= 0 {
        return 1_000_000_000;
    }
    freq
}

#[cfg(target_os = "windows")]
fn query_counter() -> i64 {
    use windows_sys::Win32::System::Performance::QueryPerformanceCounter;
    let mut count = 0i64;
    unsafe {
        QueryPerformanceCounter(&mut count);
    }
    count
}

/* --------------------------- Unix ---------------------------- */

#[cfg(unix)]
fn query_frequency() -> i64 {
    1_000_000_000
}

#[cfg(unix)]
fn query_counter() -> i64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return fallback_counter();
    }
    (ts.tv_sec as i64)
        .wrapping_mul(1_000_000_000)
        .wrapping_add(ts.tv_nsec as i64)
}

/* --------------------- Other / WASM / Fallbacks --------------------- */

#[cfg(not(any(target_os = "windows", unix)))]
fn query_frequency() -> i64 {
    1_000_000_000
}

#[cfg(not(any(target_os = "windows", unix)))]
fn query_counter() -> i64 {
    fallback_counter()
}

#[cfg(not(target_os = "windows"))]
fn fallback_counter() -> i64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static BASE: OnceLock<Instant> = OnceLock::new();
    let base = *BASE.get_or_init(Instant::now);
    base.elapsed().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_is_positive() {
        assert!(PerformanceCounter::new().frequency() > 0);
    }

    #[test]
    fn counter_does_not_go_backwards_in_a_tight_loop() {
        let counter = PerformanceCounter::new();
        let mut last = counter.now();
        for _ in 0..1000 {
            let now = counter.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn references_forward_to_the_counter() {
        fn frequency_of<C: HardwareCounter>(counter: C) -> i64 {
            counter.frequency()
        }

        let counter = PerformanceCounter::new();
        assert_eq!(frequency_of(&counter), counter.frequency());
    }
}
