//! Descriptor hygiene: close everything above stdin/stdout/stderr.
//!
//! Runs once in the supervisor after staging and before the relay pipes
//! are created, so anything a launcher left open never reaches the jail.

#![allow(unsafe_code)]

use std::os::fd::{AsRawFd, RawFd};

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tracing::debug;

use crate::error::{Context, Error, Result};

/// Directory listing the calling process's open descriptors.
const FD_DIR: &str = "/proc/self/fd";

/// Highest descriptor that is never closed (stderr).
const LAST_STDIO: RawFd = 2;

/// Returns every open descriptor above stderr.
///
/// The descriptor used to read the listing itself is excluded.
pub fn inherited() -> Result<Vec<RawFd>> {
    let mut dir = Dir::open(
        FD_DIR,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .context("open /proc/self/fd")?;
    let own = dir.as_raw_fd();

    let mut fds = Vec::new();
    for entry in dir.iter() {
        let entry = entry.context("read /proc/self/fd")?;
        let Ok(name) = entry.file_name().to_str() else {
            continue;
        };
        // Skips "." and "..".
        let Ok(fd) = name.parse::<RawFd>() else {
            continue;
        };
        if fd > LAST_STDIO && fd != own {
            fds.push(fd);
        }
    }
    fds.sort_unstable();
    Ok(fds)
}

/// Closes every descriptor above stderr. Any failure is fatal.
pub fn close_inherited() -> Result<usize> {
    let fds = inherited()?;
    for &fd in &fds {
        // SAFETY: the descriptor was listed as open and nothing in this
        // process holds an owning handle to it past this point.
        if unsafe { libc::close(fd) } != 0 {
            return Err(Error::io("close inherited descriptor", std::io::Error::last_os_error()));
        }
    }
    debug!(count = fds.len(), "closed inherited descriptors");
    Ok(fds.len())
}
