//! Host entry points
//!
//! The patcher redirects the host's timing and slot reservation routines to
//! these functions. They reach the installed [`PatchContext`] through a
//! single pointer set by [`bind`]; the host calls them from its simulation
//! thread only.

use crate::context::PatchContext;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

static CONTEXT: AtomicPtr<PatchContext> = AtomicPtr::new(ptr::null_mut());

/// Hand the context to the entry points. It lives until the process exits.
pub fn bind(ctx: PatchContext) {
    let ptr = Box::into_raw(Box::new(ctx));
    let previous = CONTEXT.swap(ptr, Ordering::AcqRel);
    if !previous.is_null() {
        tracing::warn!("patch context rebound, previous context leaked");
    }
}

pub fn is_bound() -> bool {
    !CONTEXT.load(Ordering::Acquire).is_null()
}

fn with_context<R>(f: impl FnOnce(&mut PatchContext) -> R) -> Option<R> {
    let ptr = CONTEXT.load(Ordering::Acquire);
    // SAFETY: a bound context is never freed, and only the host's simulation
    // thread enters these hooks, so no other reference is live.
    unsafe { ptr.as_mut() }.map(f)
}

pub extern "system" fn init_timers() {
    with_context(PatchContext::initialize_timers);
}

pub extern "system" fn tick_timers() {
    with_context(PatchContext::tick_timers);
}

pub extern "system" fn wait_timer(duration: i32) {
    with_context(|ctx| ctx.wait_timer(duration));
}

pub extern "system" fn allocate_slot(size: u32, flags: u32) -> *mut c_void {
    with_context(|ctx| ctx.allocate_slot(size, flags)).unwrap_or(ptr::null_mut())
}
