//! Resource limits applied to the jailed child.
//!
//! Soft and hard limits are set to the same value so the jailed program
//! cannot raise them again.

use nix::sys::resource::{Resource, setrlimit};
use tracing::debug;

use crate::error::{Context, Result};

/// Ceilings applied before the syscall filter is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Address-space size in bytes (`RLIMIT_AS`).
    pub memory: u64,
    /// Number of processes for the jailed uid (`RLIMIT_NPROC`).
    pub processes: u64,
}

impl Limits {
    /// Applies both limits to the calling process.
    pub fn apply(self) -> Result<()> {
        setrlimit(Resource::RLIMIT_AS, self.memory, self.memory).context("setrlimit(RLIMIT_AS)")?;
        setrlimit(Resource::RLIMIT_NPROC, self.processes, self.processes)
            .context("setrlimit(RLIMIT_NPROC)")?;
        debug!(memory = self.memory, processes = self.processes, "resource limits applied");
        Ok(())
    }
}
