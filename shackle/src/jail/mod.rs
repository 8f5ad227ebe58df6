//! Child-side isolation, run between `fork` and `execve`.
//!
//! The child walks a one-way sequence and never proceeds partially
//! isolated:
//!
//! 1. **Redirect**: relay pipe ends become stdin/stdout.
//! 2. **Root change**: `chdir` into the staging area, `chroot(".")`.
//! 3. **Privilege drop**: groups, gid, uid (see [`crate::identity`]).
//! 4. **Limits**: `RLIMIT_AS` and `RLIMIT_NPROC`, soft = hard.
//! 5. **No new privileges**: `PR_SET_NO_NEW_PRIVS`.
//! 6. **Filter**: compile the allow-list into a default-kill BPF program.
//! 7. **Exec**: load the filter and replace the image with the staged
//!    program, with an empty environment.
//!
//! A failing step reports itself on stderr and exits with
//! [`EXIT_FAILURE`](crate::outcome::EXIT_FAILURE).

#![allow(unsafe_code)]

mod limits;
mod seccomp;

use std::convert::Infallible;
use std::ffi::{CStr, CString};
use std::fmt;
use std::path::Path;

use tracing::{debug, error};

pub use limits::Limits;

use crate::error::{Context, Error, Result};
use crate::identity::Identity;
use crate::outcome::EXIT_FAILURE;
use crate::pipe::ChildEnds;
use crate::policy::AllowList;
use crate::staging::PROGRAM_NAME;

/// Isolation steps, in the only order they may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[non_exhaustive]
pub enum Step {
    /// Pipe ends installed as stdin/stdout.
    Redirect,
    /// Filesystem root changed to the staging area.
    RootChange,
    /// Running as the low-privilege identity.
    PrivilegeDrop,
    /// Resource limits applied.
    Limits,
    /// `no_new_privs` set.
    NoNewPrivs,
    /// Filter compiled.
    Filter,
    /// Filter loaded and image replaced.
    Exec,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Redirect => "redirect stdio",
            Self::RootChange => "chroot",
            Self::PrivilegeDrop => "drop privileges",
            Self::Limits => "apply resource limits",
            Self::NoNewPrivs => "set no_new_privs",
            Self::Filter => "build seccomp filter",
            Self::Exec => "exec program",
        })
    }
}

/// Everything the child needs, prepared before `fork`.
#[derive(Debug)]
pub struct JailPlan<'a> {
    /// Staging directory that becomes `/`.
    pub root: &'a Path,
    /// Identity to drop to.
    pub identity: &'a Identity,
    /// Resource ceilings.
    pub limits: Limits,
    /// Syscalls the program may use.
    pub allow: &'a AllowList,
    /// Path of the program inside the jail.
    pub exec_path: CString,
    /// Argument vector, `argv[0]` already rewritten.
    pub argv: Vec<CString>,
}

impl<'a> JailPlan<'a> {
    /// Builds a plan for running the staged program with `args`.
    pub fn new(
        root: &'a Path,
        identity: &'a Identity,
        limits: Limits,
        allow: &'a AllowList,
        args: &[String],
    ) -> Result<Self> {
        let exec_path = CString::new(format!("/{PROGRAM_NAME}"))?;
        let argv = std::iter::once(PROGRAM_NAME)
            .chain(args.iter().map(String::as_str))
            .map(CString::new)
            .collect::<std::result::Result<_, _>>()?;
        Ok(Self {
            root,
            identity,
            limits,
            allow,
            exec_path,
            argv,
        })
    }

    /// Isolates the calling process and replaces it with the program.
    ///
    /// Only returns on failure, naming the step that failed.
    pub fn enter(&self, ends: ChildEnds) -> std::result::Result<Infallible, (Step, Error)> {
        let at = |step: Step| move |e: Error| (step, e);

        ends.install().map_err(at(Step::Redirect))?;
        // The supervisor ignores SIGPIPE and ignored dispositions survive exec.
        // SAFETY: resetting a disposition to its default is async-signal-safe.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };

        self.change_root().map_err(at(Step::RootChange))?;
        debug!(root = %self.root.display(), "entered chroot");

        let _dropped = self.identity.drop_all().map_err(at(Step::PrivilegeDrop))?;

        self.limits.apply().map_err(at(Step::Limits))?;

        seccomp::set_no_new_privs().map_err(at(Step::NoNewPrivs))?;

        let program = seccomp::compile(self.allow).map_err(at(Step::Filter))?;

        // Nothing below this line may log: the filter only allows what the
        // staged program needs.
        seccomp::load(&program).map_err(at(Step::Filter))?;
        let env: [&CStr; 0] = [];
        let Err(errno) = nix::unistd::execve(&self.exec_path, &self.argv, &env);
        Err((Step::Exec, Error::sys("execve", errno)))
    }

    /// `chdir` into the staging area, then make it the root.
    fn change_root(&self) -> Result<()> {
        nix::unistd::chdir(self.root).context("chdir")?;
        nix::unistd::chroot(".").context("chroot")?;
        nix::unistd::chdir("/").context("chdir /")
    }
}

/// Runs the isolation sequence in a freshly forked child. Never returns.
pub fn run_child(plan: &JailPlan<'_>, ends: ChildEnds) -> ! {
    let Err((step, err)) = plan.enter(ends);
    if step == Step::Exec {
        // The filter may already be active; use nothing but write(2).
        let msg = b"shackle: unable to run program\n";
        // SAFETY: msg is a valid buffer for its length.
        unsafe { libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len()) };
    } else {
        error!(%step, "jail setup failed: {err}");
    }
    // SAFETY: _exit skips atexit handlers and stdio flushing inherited
    // from the supervisor; it is async-signal-safe.
    unsafe { libc::_exit(EXIT_FAILURE) }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn plan_for<'a>(
        identity: &'a Identity,
        allow: &'a AllowList,
        args: &[String],
    ) -> Result<JailPlan<'a>> {
        let limits = Limits {
            memory: 1 << 26,
            processes: 0,
        };
        JailPlan::new(Path::new("/tmp/hive.abc123"), identity, limits, allow, args)
    }

    #[test]
    fn argv_zero_is_rewritten_and_arguments_pass_through() {
        let me = Identity::current();
        let allow = AllowList::minimal();
        let args = vec!["-n".to_owned(), "two words".to_owned(), String::new()];
        let plan = plan_for(&me, &allow, &args).unwrap();

        assert_eq!(plan.exec_path.as_bytes(), b"/program");
        let argv: Vec<&[u8]> = plan.argv.iter().map(|a| a.as_bytes()).collect();
        assert_eq!(argv, [&b"program"[..], b"-n", b"two words", b""]);
    }

    #[test]
    fn no_arguments_leaves_only_program_name() {
        let me = Identity::current();
        let allow = AllowList::minimal();
        let plan = plan_for(&me, &allow, &[]).unwrap();
        assert_eq!(plan.argv.len(), 1);
        assert_eq!(plan.argv[0].as_bytes(), PROGRAM_NAME.as_bytes());
    }

    #[test]
    fn interior_nul_in_argument_is_rejected() {
        let me = Identity::current();
        let allow = AllowList::minimal();
        let err = plan_for(&me, &allow, &["a\0b".to_owned()]).unwrap_err();
        assert!(matches!(err, Error::Nul(_)));
    }

    #[test]
    fn steps_are_ordered() {
        assert!(Step::Redirect < Step::RootChange);
        assert!(Step::PrivilegeDrop < Step::Limits);
        assert!(Step::Filter < Step::Exec);
        assert_eq!(Step::RootChange.to_string(), "chroot");
    }
}
