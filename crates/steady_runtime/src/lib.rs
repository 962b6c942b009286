//! Steady Runtime
//!
//! Installation glue between the code patcher and the patch core: settings,
//! the installed context, and the entry points the host is redirected to.

pub mod context;
pub mod error;
pub mod hooks;
pub mod logging;
pub mod patcher;
pub mod settings;

pub use context::{InstallReport, PatchContext};
pub use error::InstallError;
pub use patcher::{BufferAddresses, ClockAddresses, HookRequest, PatchError, Patcher};
pub use settings::Settings;

/// Install every enabled feature and bind it to the host entry points.
pub fn install(patcher: &mut impl Patcher, settings: &Settings) -> InstallReport {
    tracing::info!("steady patch v{}", steady_core::VERSION);
    let ctx = PatchContext::install(patcher, settings);
    let report = ctx.report();
    hooks::bind(ctx);
    report
}
