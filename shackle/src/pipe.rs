//! The two relay pipes between supervisor and jailed child.
//!
//! Both pipes are created with `O_CLOEXEC`. After `fork` each side takes
//! ownership of its two ends and closes the other two immediately, so a
//! stray copy can never hold a pipe open and hide end-of-stream.

#![allow(unsafe_code)]

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;

use crate::error::{Context, Error, Result};

/// Both relay pipes, before ownership is split by `fork`.
#[derive(Debug)]
pub struct RelayPipes {
    /// Read end of the supervisor → child pipe (child's stdin).
    stdin_read: OwnedFd,
    /// Write end of the supervisor → child pipe.
    stdin_write: OwnedFd,
    /// Read end of the child → supervisor pipe.
    stdout_read: OwnedFd,
    /// Write end of the child → supervisor pipe (child's stdout).
    stdout_write: OwnedFd,
}

/// The ends retained by the jailed child.
#[derive(Debug)]
pub struct ChildEnds {
    /// Becomes fd 0.
    stdin: OwnedFd,
    /// Becomes fd 1.
    stdout: OwnedFd,
}

/// The ends retained by the supervisor, both non-blocking.
#[derive(Debug)]
pub struct ParentEnds {
    /// Feeds the child's stdin.
    pub to_child: File,
    /// Carries the child's stdout.
    pub from_child: File,
}

impl RelayPipes {
    /// Creates both pipes.
    pub fn create() -> Result<Self> {
        let (stdin_read, stdin_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).context("pipe")?;
        let (stdout_read, stdout_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).context("pipe")?;
        Ok(Self {
            stdin_read,
            stdin_write,
            stdout_read,
            stdout_write,
        })
    }

    /// Keeps the child's ends and closes the supervisor's.
    pub fn into_child(self) -> ChildEnds {
        drop(self.stdin_write);
        drop(self.stdout_read);
        ChildEnds {
            stdin: self.stdin_read,
            stdout: self.stdout_write,
        }
    }

    /// Keeps the supervisor's ends, closes the child's, and switches the
    /// kept ends to non-blocking mode.
    pub fn into_parent(self) -> Result<ParentEnds> {
        drop(self.stdin_read);
        drop(self.stdout_write);
        set_nonblocking(&self.stdin_write).context("set O_NONBLOCK")?;
        set_nonblocking(&self.stdout_read).context("set O_NONBLOCK")?;
        Ok(ParentEnds {
            to_child: File::from(self.stdin_write),
            from_child: File::from(self.stdout_read),
        })
    }
}

impl ChildEnds {
    /// Installs the pipe ends as stdin and stdout.
    ///
    /// The duplicated descriptors do not carry `O_CLOEXEC`, so they survive
    /// the final `execve`; the originals are closed.
    pub fn install(self) -> Result<()> {
        install_as(self.stdin, libc::STDIN_FILENO)?;
        install_as(self.stdout, libc::STDOUT_FILENO)
    }
}

/// Duplicates `fd` onto `target` and closes the original.
fn install_as(fd: OwnedFd, target: RawFd) -> Result<()> {
    if fd.as_raw_fd() == target {
        // Already in place; clear close-on-exec instead of duplicating.
        let raw = fd.into_raw_fd();
        // SAFETY: raw is a valid descriptor we own.
        if unsafe { libc::fcntl(raw, libc::F_SETFD, 0) } == -1 {
            return Err(Error::io("fcntl(F_SETFD)", io::Error::last_os_error()));
        }
        return Ok(());
    }
    // SAFETY: both descriptors are valid; dup2 is async-signal-safe.
    if unsafe { libc::dup2(fd.as_raw_fd(), target) } == -1 {
        return Err(Error::io("dup2", io::Error::last_os_error()));
    }
    Ok(())
}

/// Sets `O_NONBLOCK` on a file descriptor.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl(F_GETFL/F_SETFL) on a valid descriptor.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn parent_ends_are_nonblocking() {
        let ends = RelayPipes::create().unwrap().into_parent().unwrap();
        let mut from_child = ends.from_child;
        let mut buf = [0u8; 8];
        // Write end is already closed, so this reports end-of-stream.
        assert_eq!(from_child.read(&mut buf).unwrap(), 0);

        let flags = unsafe { libc::fcntl(ends.to_child.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);
    }

    #[test]
    fn full_pipe_reports_would_block() {
        let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        set_nonblocking(&w).unwrap();
        let mut w = File::from(w);
        let chunk = [0u8; 4096];
        let err = loop {
            if let Err(e) = w.write(&chunk) {
                break e;
            }
        };
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        drop(r);
    }
}
