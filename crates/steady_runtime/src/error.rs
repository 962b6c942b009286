use crate::patcher::PatchError;
use steady_core::buffer::BufferError;
use thiserror::Error;

/// Reasons a feature was skipped at install time.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("resolved address for {what} is null")]
    NullAddress { what: &'static str },
}
