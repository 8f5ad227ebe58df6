//! Default-deny syscall filter built from an [`AllowList`].
//!
//! Any syscall outside the list kills the whole process with `SIGSYS`.
//! The filter survives `execve`, so it constrains the staged program.

#![allow(unsafe_code)]

use std::collections::BTreeMap;
use std::io;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
use tracing::debug;

use crate::error::{Error, Result};
use crate::policy::{AllowList, NativeTable};

/// Compiles `allow` into a BPF program for the build architecture.
pub fn compile(allow: &AllowList) -> Result<BpfProgram> {
    let arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e| Error::Filter(format!("{e:?}")))?;

    // An empty rule vector matches the syscall unconditionally.
    let rules: BTreeMap<i64, Vec<SeccompRule>> = allow
        .resolve(&NativeTable)
        .into_iter()
        .map(|nr| (nr, Vec::new()))
        .collect();
    let count = rules.len();

    let filter = SeccompFilter::new(rules, SeccompAction::KillProcess, SeccompAction::Allow, arch)
        .map_err(|e| Error::Filter(e.to_string()))?;
    let program: BpfProgram = filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| Error::Filter(e.to_string()))?;
    debug!(syscalls = count, instructions = program.len(), "seccomp filter compiled");
    Ok(program)
}

/// Forbids gaining privileges through set-user-ID/set-group-ID binaries.
pub fn set_no_new_privs() -> Result<()> {
    // SAFETY: prctl(PR_SET_NO_NEW_PRIVS) takes no pointers.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } == -1 {
        return Err(Error::io("prctl(PR_SET_NO_NEW_PRIVS)", io::Error::last_os_error()));
    }
    Ok(())
}

/// Installs `program` on the calling thread. Irreversible.
pub fn load(program: &BpfProgram) -> Result<()> {
    seccompiler::apply_filter(program).map_err(|e| Error::Filter(e.to_string()))
}
