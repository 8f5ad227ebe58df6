//! End-to-end orchestration of one jailed run.
//!
//! ```text
//! lookup identity → stage program → close inherited fds → pipes → fork
//!   child:  jail::run_child (never returns)
//!   parent: drop privileges → relay → reap → remove staging area
//! ```
//!
//! The staging area is removed on every path once it exists, and the child
//! is always reaped: [`JailedChild`] kills and collects it on drop if the
//! supervisor bails out early.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::{ForkResult, Pid};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Context, Error, Result};
use crate::fds;
use crate::identity::Identity;
use crate::jail::{self, JailPlan, Limits};
use crate::outcome::ExitOutcome;
use crate::pipe::RelayPipes;
use crate::relay::{self, ChildProcess, Relay, RelayReport};
use crate::staging::StagingArea;

/// Signals that ask the supervisor to kill the child and clean up.
const STOP_SIGNALS: [libc::c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

/// A request to run one program in the jail.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Invocation {
    /// Host path of the executable to stage.
    pub program: PathBuf,
    /// Arguments passed after the in-jail program name.
    pub args: Vec<String>,
}

impl Invocation {
    /// Creates an invocation of `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Runs `invocation` under `config` and returns how the child ended.
///
/// Must be called from a single-threaded process: it forks.
pub fn run(config: &Config, invocation: &Invocation) -> Result<RelayReport> {
    let identity = Identity::lookup(&config.user)?;
    debug!(user = %identity.name, uid = %identity.uid, gid = %identity.gid, "identity resolved");

    let staging = StagingArea::create(&config.staging_root, &invocation.program, &identity)?;
    let staged_path = staging.path().to_owned();

    let result = supervise(config, invocation, &identity, staging.path());
    let removed = staging.remove();

    match (result, removed) {
        (Ok(report), Ok(())) => {
            info!(
                outcome = %report.outcome,
                timed_out = report.timed_out,
                bytes_in = report.bytes_in,
                bytes_out = report.bytes_out,
                elapsed = ?report.elapsed,
                "run finished"
            );
            Ok(report)
        }
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(teardown)) => {
            error!(path = %staged_path.display(), "teardown failed: {teardown}");
            Err(e)
        }
    }
}

/// Everything between staging and teardown.
fn supervise(
    config: &Config,
    invocation: &Invocation,
    identity: &Identity,
    root: &Path,
) -> Result<RelayReport> {
    fds::close_inherited()?;

    let plan = JailPlan::new(
        root,
        identity,
        Limits {
            memory: config.memory_limit,
            processes: config.max_processes,
        },
        &config.allow,
        &invocation.args,
    )?;

    let stop = relay::stop_flag();
    for sig in STOP_SIGNALS {
        signal_hook::flag::register(sig, Arc::clone(&stop)).context("register signal handler")?;
    }

    let stdin = real_stdin()?;
    let pipes = RelayPipes::create()?;

    // SAFETY: the supervisor is single-threaded; the child only runs the
    // isolation sequence and then execs or exits.
    let fork = unsafe { nix::unistd::fork() }.context("fork")?;
    let pid = match fork {
        ForkResult::Child => jail::run_child(&plan, pipes.into_child()),
        ForkResult::Parent { child } => child,
    };
    let mut child = JailedChild::new(pid);
    debug!(pid = %pid, "child forked");

    let ends = pipes.into_parent()?;
    let _dropped = identity.drop_all()?;

    let stdout = io::stdout().lock();
    Relay::new(stdin, stdout, ends.to_child, ends.from_child).run(&mut child, config.timeout, &stop)
}

/// Duplicates the real stdin, or returns `None` if it is closed.
fn real_stdin() -> Result<Option<File>> {
    match io::stdin().as_fd().try_clone_to_owned() {
        Ok(fd) => Ok(Some(File::from(fd))),
        Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(None),
        Err(e) => Err(Error::io("dup stdin", e)),
    }
}

/// The forked, jailed process.
///
/// Dropping an unreaped child kills and reaps it.
#[derive(Debug)]
pub struct JailedChild {
    /// Process id returned by `fork`.
    pid: Pid,
    /// Set once `waitpid` has collected the child.
    reaped: bool,
}

impl JailedChild {
    /// Wraps a freshly forked child.
    pub const fn new(pid: Pid) -> Self {
        Self { pid, reaped: false }
    }

    /// Process id of the child.
    pub const fn pid(&self) -> Pid {
        self.pid
    }
}

impl ChildProcess for JailedChild {
    fn try_exit(&mut self) -> Result<Option<ExitOutcome>> {
        // WNOWAIT leaves the child collectable by `reap`.
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        match waitid(Id::Pid(self.pid), flags) {
            Ok(status) => Ok(outcome(status)),
            Err(Errno::EINTR) => Ok(None),
            Err(e) => Err(Error::sys("waitid", e)),
        }
    }

    fn kill(&mut self) -> Result<()> {
        kill(self.pid, Signal::SIGKILL).context("kill")
    }

    fn reap(&mut self) -> Result<ExitOutcome> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(outcome) = outcome(status) {
                        self.reaped = true;
                        return Ok(outcome);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(e) => return Err(Error::sys("waitpid", e)),
            }
        }
    }
}

impl Drop for JailedChild {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = ChildProcess::kill(self);
            let _ = self.reap();
        }
    }
}

/// Maps a terminal wait status to an outcome; `None` while still running.
fn outcome(status: WaitStatus) -> Option<ExitOutcome> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitOutcome::Exited(code)),
        WaitStatus::Signaled(_, sig, _) => Some(ExitOutcome::Signaled(sig as libc::c_int)),
        _ => None,
    }
}
