// SPDX-License-Identifier: GPL-3.0-or-later
use thiserror::Error;

/// The one error type every fallible executor operation returns through. Variants line up
/// with the error kinds in the design notes: transport, marshaling, vendor-library, coverage
/// and configuration failures each carry enough context to log without further digging.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("marshaling error: {0}")]
    Marshal(String),

    #[error("vendor library error: {0}")]
    VendorLibrary(String),

    #[error("coverage plumbing error: {0}")]
    Coverage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("signal handling error: {0}")]
    Signal(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
