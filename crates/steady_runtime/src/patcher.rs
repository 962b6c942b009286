//! Interface to the code patcher
//!
//! Pattern scanning and instruction rewriting live outside this crate. The
//! patcher hands over resolved addresses and installs redirections; this
//! crate decides what to redirect and where to.

use steady_core::buffer::DependentSite;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("pattern for {what} not found")]
    NotFound { what: &'static str },

    #[error("failed to hook {target:#x}: {reason}")]
    HookFailed { target: usize, reason: String },
}

/// Host addresses the frame clock needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockAddresses {
    pub init_timers: usize,
    pub tick_timers: usize,
    pub wait_timer: usize,
    pub tick_delta: usize,
    pub current_time: usize,
    pub window_active: usize,
}

/// Host addresses the buffer manager needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferAddresses {
    /// The host's "reserve next slot" routine.
    pub allocate_slot: usize,
    /// The host's original static array.
    pub array: usize,
    /// The host's live entry count (`u32`).
    pub logical_count: usize,
    pub sites: Vec<DependentSite>,
}

/// One redirection: calls to `target` go to `replacement` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookRequest {
    pub target: usize,
    pub replacement: usize,
}

impl HookRequest {
    pub fn new(target: usize, replacement: usize) -> Self {
        Self { target, replacement }
    }
}

pub trait Patcher {
    fn resolve_clock(&mut self) -> Result<ClockAddresses, PatchError>;

    fn resolve_buffer(&mut self) -> Result<BufferAddresses, PatchError>;

    /// Install a batch of redirections as one transaction.
    ///
    /// Either every hook is installed or none is. On success returns, per
    /// request and in order, an address that still runs the original routine.
    fn install_hooks(&mut self, hooks: &[HookRequest]) -> Result<Vec<usize>, PatchError>;
}
