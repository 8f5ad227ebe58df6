//! Named syscall capabilities and their per-architecture resolution.
//!
//! The jail's allow-list is expressed as a set of [`Capability`] values
//! rather than raw syscall numbers. A [`SyscallTable`] maps each capability
//! to the numbers of the build target, so the policy can be inspected and
//! tested without touching the kernel.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Version of the capability vocabulary understood by this build.
pub const POLICY_VERSION: u32 = 1;

/// A class of kernel operation the jailed program may perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Capability {
    /// Read from an already-open descriptor.
    Read,
    /// Write to an already-open descriptor.
    Write,
    /// Terminate the process.
    Exit,
    /// Return from a signal handler.
    SigReturn,
    /// Adjust the program break.
    Brk,
    /// Replace the process image (needed for the final `execve` itself).
    Exec,
    /// Change memory protection.
    Mprotect,
    /// Futex waits and wakes.
    Futex,
    /// Map memory.
    Mmap,
    /// Reposition a file offset.
    Lseek,
    /// Query file status.
    Fstat,
    /// Resolve symbolic links.
    Readlink,
    /// Read from the kernel randomness source.
    Getrandom,
    /// Query resource limits.
    Prlimit,
    /// Register restartable sequences.
    Rseq,
    /// Register the robust futex list.
    RobustList,
    /// Register the clear-child-tid address.
    TidAddress,
    /// Architecture-specific thread setup (TLS register).
    ThreadSetup,
}

impl Capability {
    /// Every capability known to [`POLICY_VERSION`].
    pub const ALL: [Self; 18] = [
        Self::Read,
        Self::Write,
        Self::Exit,
        Self::SigReturn,
        Self::Brk,
        Self::Exec,
        Self::Mprotect,
        Self::Futex,
        Self::Mmap,
        Self::Lseek,
        Self::Fstat,
        Self::Readlink,
        Self::Getrandom,
        Self::Prlimit,
        Self::Rseq,
        Self::RobustList,
        Self::TidAddress,
        Self::ThreadSetup,
    ];

    /// Kebab-case name, as used in configuration files.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exit => "exit",
            Self::SigReturn => "sig-return",
            Self::Brk => "brk",
            Self::Exec => "exec",
            Self::Mprotect => "mprotect",
            Self::Futex => "futex",
            Self::Mmap => "mmap",
            Self::Lseek => "lseek",
            Self::Fstat => "fstat",
            Self::Readlink => "readlink",
            Self::Getrandom => "getrandom",
            Self::Prlimit => "prlimit",
            Self::Rseq => "rseq",
            Self::RobustList => "robust-list",
            Self::TidAddress => "tid-address",
            Self::ThreadSetup => "thread-setup",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A versioned set of capabilities granted to the jailed program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowList {
    /// Vocabulary version the set was written against.
    pub version: u32,
    /// Granted capabilities.
    pub capabilities: BTreeSet<Capability>,
}

impl Default for AllowList {
    fn default() -> Self {
        Self::minimal()
    }
}

impl AllowList {
    /// The smallest set that still loads and runs a static binary.
    pub fn minimal() -> Self {
        Self {
            version: POLICY_VERSION,
            capabilities: Capability::ALL.into_iter().collect(),
        }
    }

    /// Returns `true` if `cap` is granted.
    pub fn allows(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }

    /// Resolves the set to concrete syscall numbers via `table`.
    ///
    /// Capabilities with no counterpart on the target (for example thread
    /// setup on aarch64) contribute nothing.
    pub fn resolve(&self, table: &impl SyscallTable) -> BTreeSet<i64> {
        self.capabilities
            .iter()
            .flat_map(|&cap| table.syscalls(cap).iter().copied())
            .collect()
    }
}

/// Maps capabilities to syscall numbers for one architecture.
pub trait SyscallTable {
    /// Syscall numbers that implement `cap` on this architecture.
    fn syscalls(&self, cap: Capability) -> &'static [i64];
}

/// Syscall table for the architecture this crate was built for.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTable;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl SyscallTable for NativeTable {
    fn syscalls(&self, cap: Capability) -> &'static [i64] {
        match cap {
            Capability::Read => &[libc::SYS_read],
            Capability::Write => &[libc::SYS_write],
            Capability::Exit => &[libc::SYS_exit_group, libc::SYS_exit],
            Capability::SigReturn => &[libc::SYS_rt_sigreturn],
            Capability::Brk => &[libc::SYS_brk],
            Capability::Exec => &[libc::SYS_execve],
            Capability::Mprotect => &[libc::SYS_mprotect],
            Capability::Futex => &[libc::SYS_futex],
            Capability::Mmap => &[libc::SYS_mmap],
            Capability::Lseek => &[libc::SYS_lseek],
            Capability::Fstat => &[libc::SYS_fstat, libc::SYS_newfstatat],
            Capability::Readlink => &[libc::SYS_readlinkat, libc::SYS_readlink],
            Capability::Getrandom => &[libc::SYS_getrandom],
            Capability::Prlimit => &[libc::SYS_prlimit64],
            Capability::Rseq => &[libc::SYS_rseq],
            Capability::RobustList => &[libc::SYS_set_robust_list],
            Capability::TidAddress => &[libc::SYS_set_tid_address],
            Capability::ThreadSetup => &[libc::SYS_arch_prctl],
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
impl SyscallTable for NativeTable {
    fn syscalls(&self, cap: Capability) -> &'static [i64] {
        match cap {
            Capability::Read => &[libc::SYS_read],
            Capability::Write => &[libc::SYS_write],
            Capability::Exit => &[libc::SYS_exit_group, libc::SYS_exit],
            Capability::SigReturn => &[libc::SYS_rt_sigreturn],
            Capability::Brk => &[libc::SYS_brk],
            Capability::Exec => &[libc::SYS_execve],
            Capability::Mprotect => &[libc::SYS_mprotect],
            Capability::Futex => &[libc::SYS_futex],
            Capability::Mmap => &[libc::SYS_mmap],
            Capability::Lseek => &[libc::SYS_lseek],
            Capability::Fstat => &[libc::SYS_fstat, libc::SYS_newfstatat],
            Capability::Readlink => &[libc::SYS_readlinkat],
            Capability::Getrandom => &[libc::SYS_getrandom],
            Capability::Prlimit => &[libc::SYS_prlimit64],
            Capability::Rseq => &[libc::SYS_rseq],
            Capability::RobustList => &[libc::SYS_set_robust_list],
            Capability::TidAddress => &[libc::SYS_set_tid_address],
            // TLS is set up through a register write, no syscall needed.
            Capability::ThreadSetup => &[],
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Assigns each capability a fake number equal to its position in `ALL`.
    struct FakeTable;

    impl SyscallTable for FakeTable {
        fn syscalls(&self, cap: Capability) -> &'static [i64] {
            const NUMS: [i64; 18] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17];
            let idx = Capability::ALL.iter().position(|&c| c == cap).unwrap();
            match cap {
                // Simulates an architecture without a thread-setup syscall.
                Capability::ThreadSetup => &[],
                _ => &NUMS[idx..=idx],
            }
        }
    }

    #[test]
    fn minimal_grants_every_capability() {
        let list = AllowList::minimal();
        assert_eq!(list.version, POLICY_VERSION);
        for cap in Capability::ALL {
            assert!(list.allows(cap), "{cap} missing");
        }
    }

    #[test]
    fn resolve_skips_capabilities_without_syscalls() {
        let numbers = AllowList::minimal().resolve(&FakeTable);
        assert_eq!(numbers.len(), 17);
        assert!(!numbers.contains(&17));
    }

    #[test]
    fn resolve_only_includes_granted() {
        let list = AllowList {
            version: POLICY_VERSION,
            capabilities: [Capability::Read, Capability::Exit].into_iter().collect(),
        };
        let numbers: Vec<i64> = list.resolve(&FakeTable).into_iter().collect();
        assert_eq!(numbers, vec![0, 2]);
    }

    #[test]
    fn names_match_serde_representation() {
        for cap in Capability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.name()));
        }
    }

    #[test]
    fn parses_from_config_json() {
        let list: AllowList =
            serde_json::from_str(r#"{"version":1,"capabilities":["read","write","sig-return"]}"#)
                .unwrap();
        assert!(list.allows(Capability::SigReturn));
        assert!(!list.allows(Capability::Mmap));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn native_table_covers_core_syscalls() {
        let numbers = AllowList::minimal().resolve(&NativeTable);
        assert!(numbers.contains(&libc::SYS_read));
        assert!(numbers.contains(&libc::SYS_write));
        assert!(numbers.contains(&libc::SYS_execve));
        assert!(numbers.contains(&libc::SYS_exit_group));
        assert!(!numbers.contains(&libc::SYS_openat));
        assert!(!numbers.contains(&libc::SYS_clone));
    }
}
