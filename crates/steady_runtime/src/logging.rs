//! Logging setup

use std::str::FromStr;
use tracing::Level;

/// Install the global fmt subscriber.
///
/// Unknown levels fall back to `info`. Later calls are no-ops.
pub fn init(level: &str) {
    let level = Level::from_str(level).unwrap_or(Level::INFO);
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(%level, "logging initialized");
    }
}
