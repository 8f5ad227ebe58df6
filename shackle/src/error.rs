//! Error types for shackle operations.

use std::ffi::NulError;
use std::io;

/// Alias for `Result<T, shackle::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned while staging, jailing, relaying, or tearing down a run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A raw system call failed.
    #[cfg(target_os = "linux")]
    #[error("{op}: {source}")]
    Sys {
        /// The operation that failed.
        op: &'static str,
        /// The errno reported by the kernel.
        source: nix::errno::Errno,
    },

    /// A filesystem or stream operation failed.
    #[error("{op}: {source}")]
    Io {
        /// The operation that failed.
        op: &'static str,
        /// The underlying I/O error.
        source: io::Error,
    },

    /// The low-privilege account does not exist in the identity database.
    #[error("no such user: {0}")]
    UnknownIdentity(String),

    /// The deployment configuration is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The syscall filter could not be compiled or loaded.
    #[error("seccomp filter: {0}")]
    Filter(String),

    /// A path or argument contained an interior NUL byte.
    #[error("interior NUL byte in argument")]
    Nul(#[from] NulError),
}

impl Error {
    /// Wraps an I/O error with the name of the operation that produced it.
    pub const fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    /// Wraps an errno with the name of the system call that produced it.
    #[cfg(target_os = "linux")]
    pub const fn sys(op: &'static str, source: nix::errno::Errno) -> Self {
        Self::Sys { op, source }
    }
}

/// Attaches an operation name to fallible results.
pub(crate) trait Context<T> {
    /// Maps the error into an [`Error`] naming `op`.
    fn context(self, op: &'static str) -> Result<T>;
}

impl<T> Context<T> for io::Result<T> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::io(op, e))
    }
}

#[cfg(target_os = "linux")]
impl<T> Context<T> for nix::Result<T> {
    fn context(self, op: &'static str) -> Result<T> {
        self.map_err(|e| Error::sys(op, e))
    }
}
