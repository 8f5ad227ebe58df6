//! How a jailed run ended, and the exit code the supervisor reports.

use std::fmt;

/// Exit code for a missing executable argument.
pub const EXIT_USAGE: i32 = 125;

/// Exit code for any supervisor-internal failure, and for a child that
/// could not finish isolating itself.
pub const EXIT_FAILURE: i32 = 127;

/// Offset added to a signal number, as shells do.
const SIGNAL_BASE: i32 = 128;

/// Final state of the jailed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExitOutcome {
    /// The child called `exit` with this code.
    Exited(i32),
    /// The child was terminated by this signal number.
    Signaled(i32),
}

impl ExitOutcome {
    /// The supervisor's own exit code for this outcome.
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => SIGNAL_BASE + sig,
        }
    }

    /// Returns `true` if the child exited with status 0.
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Signaled(sig) => write!(f, "killed by signal {sig}"),
        }
    }
}
