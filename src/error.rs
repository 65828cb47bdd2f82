//! Error types for the interface bridge.

use std::io;

use thiserror::Error;

use crate::stack::StackError;

/// Main error type for bridge operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied parameter was rejected before any system call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A system call failed; carries the failing operation and the errno.
    #[error("{op}: {source}")]
    SystemCall {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A kernel message or MLD report could not be decoded.
    #[error("malformed {0} message")]
    Parse(&'static str),

    /// The stack rejected an operation.
    #[error("stack rejected operation: {0}")]
    Stack(#[from] StackError),

    /// Unrecoverable runtime failure; the embedding process must terminate.
    #[error("fatal: {0}")]
    Fatal(&'static str),
}

impl Error {
    /// Capture the current errno for a failed system call.
    pub(crate) fn syscall(op: &'static str) -> Self {
        Error::SystemCall {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Process exit code for the embedding daemon: invalid arguments and
    /// errno-originated init failures get distinct codes, everything else is
    /// a generic runtime failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => 2,
            Error::SystemCall { .. } => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
