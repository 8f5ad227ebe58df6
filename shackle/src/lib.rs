//! Run one untrusted program inside a disposable jail.
//!
//! `shackle` copies a program into a fresh staging directory, forks a child
//! that confines itself there (chroot, unprivileged identity, resource
//! limits, `no_new_privs`, a default-kill seccomp allow-list) and execs the
//! program with an empty environment. The supervisor drops its own
//! privileges, relays stdin/stdout through two pipes under a wall-clock
//! deadline, reaps the child and removes the staging directory.
//!
//! # Quick start
//!
//! ```no_run
//! use shackle::{Config, Invocation};
//!
//! let config = Config::load().expect("invalid configuration");
//! let report = shackle::run(&config, &Invocation::new("./solution", vec![]))
//!     .expect("supervisor failed");
//! std::process::exit(report.outcome.code());
//! ```
//!
//! Requires Linux and enough privilege to `chroot`, `chown` and change
//! identity.

mod config;
mod error;
mod outcome;
mod policy;

#[cfg(target_os = "linux")]
mod fds;
#[cfg(target_os = "linux")]
mod identity;
#[cfg(target_os = "linux")]
mod jail;
#[cfg(target_os = "linux")]
mod pipe;
#[cfg(target_os = "linux")]
mod relay;
#[cfg(target_os = "linux")]
mod staging;
#[cfg(target_os = "linux")]
mod supervisor;

pub use config::{
    Config, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT, DEFAULT_USER, ENV_CONFIG, MAX_TIMEOUT,
};
pub use error::{Error, Result};
#[cfg(target_os = "linux")]
pub use identity::{Dropped, Elevated, GidSet, GroupsSet, Identity, PrivilegeDrop};
#[cfg(target_os = "linux")]
pub use jail::{Limits, Step};
pub use outcome::{EXIT_FAILURE, EXIT_USAGE, ExitOutcome};
#[cfg(target_os = "linux")]
pub use policy::NativeTable;
pub use policy::{AllowList, Capability, POLICY_VERSION, SyscallTable};
#[cfg(target_os = "linux")]
pub use relay::{ChildProcess, RelayReport};
#[cfg(target_os = "linux")]
pub use staging::StagingArea;
#[cfg(target_os = "linux")]
pub use supervisor::{Invocation, JailedChild, run};
