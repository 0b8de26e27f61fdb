// SPDX-License-Identifier: GPL-3.0-or-later
pub mod bytestream;
pub mod cmdline;
pub mod error;
pub mod forkserver;
pub mod framing;
pub mod gp;
pub mod loader;
pub mod teec;

pub use error::ExecutorError;

/// The level to filter runtime logging at; absent entirely, logging stays off.
#[derive(clap::ValueEnum, Debug, Copy, Clone, Eq, PartialEq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Self::Error => tracing::Level::ERROR,
            Self::Warn => tracing::Level::WARN,
            Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

/// EXECUTOR_SUCCESS as reported on the wire (not a TEE-level success code).
pub const EXECUTOR_SUCCESS: i32 = 42;
/// EXECUTOR_ERROR as reported on the wire.
pub const EXECUTOR_ERROR: i32 = 1;

/// Data-socket command bytes driving a backend session's state machine.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Command {
    Start = 1,
    Send = 2,
    End = 3,
    Terminate = 4,
}

impl Command {
    pub fn from_byte(b: u8) -> Result<Self, ExecutorError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Send),
            3 => Ok(Self::End),
            4 => Ok(Self::Terminate),
            _ => Err(ExecutorError::Marshal(format!("unrecognized command byte {b}"))),
        }
    }
}

/// Exit code a child reports after handling TERMINATE; observed by the forkserver parent to
/// set `stop_soon`. Not the forkserver process's own exit status (see the "Open questions"
/// section of the design notes).
pub const CHILD_EXIT_TERMINATE: i32 = 130;
