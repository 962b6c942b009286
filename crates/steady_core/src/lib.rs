//! Steady Core
//!
//! The two components the patch installs into the host:
//! - Drift-free frame clock driven by the hardware counter
//! - Self-expanding replacement for a fixed-capacity host array
//!
//! Both operate on host memory through [`host::HostCell`] and receive every
//! address from the installer; neither discovers anything on its own.

pub mod buffer;
pub mod host;
pub mod time;

pub use steady_env;

/// Patch version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
