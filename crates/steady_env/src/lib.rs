//! Steady Environment
//!
//! Platform facilities the patch core is built on:
//! - Monotonic high-resolution counter
//! - Scoped memory protection toggling for code/data patching

pub mod counter;
pub mod protect;

pub use counter::{HardwareCounter, PerformanceCounter};
pub use protect::{
    page_size, MemoryProtector, NoProtection, ProtectError, Region, ScopedUnprotect, SystemProtector,
};
