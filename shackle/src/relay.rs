//! Supervisor-side byte relay between the real stdio and the jailed child.
//!
//! A single-threaded loop. Each pass waits at most [`TICK`] in `poll(2)`,
//! then makes non-blocking attempts in a fixed order:
//!
//! 1. read stdin into the pending buffer (only when it is empty),
//! 2. flush the pending buffer into the child's stdin pipe,
//! 3. drain the child's stdout pipe into our stdout,
//! 4. check, without reaping, whether the child has terminated.
//!
//! Draining always happens before the exit check, and once the loop ends
//! the child is reaped and its pipe drained to end-of-stream, so no byte
//! written before termination is lost.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Context, Error, Result};
use crate::outcome::ExitOutcome;

/// Longest single wait inside the loop.
pub const TICK: Duration = Duration::from_millis(10);

/// Read size for both directions.
const CHUNK: usize = 64 * 1024;

/// Control over the jailed process, as seen by the relay.
pub trait ChildProcess {
    /// Reports the outcome if the child has terminated, without reaping it.
    fn try_exit(&mut self) -> Result<Option<ExitOutcome>>;

    /// Sends `SIGKILL`.
    fn kill(&mut self) -> Result<()>;

    /// Blocks until the child is collected and returns its outcome.
    fn reap(&mut self) -> Result<ExitOutcome>;
}

/// Summary of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RelayReport {
    /// How the child ended.
    pub outcome: ExitOutcome,
    /// The deadline expired and the child was killed.
    pub timed_out: bool,
    /// A stop signal arrived and the child was killed.
    pub stopped: bool,
    /// Bytes forwarded to the child's stdin.
    pub bytes_in: u64,
    /// Bytes forwarded from the child's stdout.
    pub bytes_out: u64,
    /// Time from loop start to reap.
    pub elapsed: Duration,
}

/// Relay state for one child.
#[derive(Debug)]
pub struct Relay<I, O> {
    /// Real stdin; `None` once it reached end-of-input or stopped mattering.
    input: Option<I>,
    /// Real stdout.
    output: O,
    /// Write end of the child's stdin pipe; dropped to signal end-of-input.
    to_child: Option<File>,
    /// Read end of the child's stdout pipe.
    from_child: File,
    /// Bytes read from stdin the child has not accepted yet.
    pending: Vec<u8>,
    /// Child's stdout reached end-of-stream.
    outbound_done: bool,
    /// Bytes written into the child's stdin pipe.
    bytes_in: u64,
    /// Bytes written to our stdout.
    bytes_out: u64,
    /// Scratch buffer.
    buf: Box<[u8]>,
}

impl<I, O> Relay<I, O>
where
    I: Read + AsFd,
    O: Write,
{
    /// Creates a relay. `to_child` and `from_child` must be non-blocking.
    pub fn new(input: Option<I>, output: O, to_child: File, from_child: File) -> Self {
        Self {
            input,
            output,
            to_child: Some(to_child),
            from_child,
            pending: Vec::new(),
            outbound_done: false,
            bytes_in: 0,
            bytes_out: 0,
            buf: vec![0u8; CHUNK].into_boxed_slice(),
        }
    }

    /// Runs until the child terminates, the deadline passes, or `stop` is
    /// set. The child is always reaped before returning, even on error.
    pub fn run(
        mut self,
        child: &mut impl ChildProcess,
        timeout: Duration,
        stop: &AtomicBool,
    ) -> Result<RelayReport> {
        let start = Instant::now();
        let Some(deadline) = start.checked_add(timeout) else {
            let _ = child.kill();
            child.reap()?;
            return Err(Error::Config(format!("timeout of {timeout:?} is out of range")));
        };
        let mut timed_out = false;
        let mut stopped = false;

        let looped = loop {
            if stop.load(Ordering::SeqCst) {
                warn!("stop requested, killing child");
                stopped = true;
                break child.kill();
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(timeout = ?timeout, "deadline reached, killing child");
                timed_out = true;
                break child.kill();
            }
            if let Err(e) = self.pass(deadline - now) {
                break Err(e);
            }
            match child.try_exit() {
                Ok(Some(_)) => break Ok(()),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
        };

        if looped.is_err() {
            // Relay failed with the child possibly alive; it must not outlive us.
            let _ = child.kill();
        }
        let outcome = child.reap()?;
        looped?;
        self.drain_to_end()?;

        let report = RelayReport {
            outcome,
            timed_out,
            stopped,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            elapsed: start.elapsed(),
        };
        debug!(?report, "relay finished");
        Ok(report)
    }

    /// One iteration: wait for readiness, then move bytes both ways.
    fn pass(&mut self, remaining: Duration) -> Result<()> {
        let stdin_ready = self.wait(remaining.min(TICK))?;
        if stdin_ready {
            self.read_input()?;
        }
        self.flush_pending()?;
        self.drain_outbound()
    }

    /// Polls stdin and the child's stdout. Returns whether stdin is ready.
    fn wait(&self, timeout: Duration) -> Result<bool> {
        let mut fds = Vec::with_capacity(2);
        let watch_input = self.pending.is_empty() && self.to_child.is_some();
        if let Some(input) = self.input.as_ref().filter(|_| watch_input) {
            fds.push(libc::pollfd {
                fd: input.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if !self.outbound_done {
            fds.push(libc::pollfd {
                fd: self.from_child.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }

        #[allow(clippy::cast_possible_truncation)]
        let ms = timeout.as_millis().max(1) as libc::c_int;
        // SAFETY: fds is a valid array of initialized pollfd structs.
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ms) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::io("poll", err));
        }
        // Readable, hung up, or invalid all mean a read will not block.
        Ok(self.input.is_some() && watch_input && fds[0].revents != 0)
    }

    /// Reads one chunk from stdin into the pending buffer.
    fn read_input(&mut self) -> Result<()> {
        let Some(input) = self.input.as_mut() else {
            return Ok(());
        };
        match input.read(&mut self.buf) {
            Ok(0) => {
                debug!("stdin reached end of input");
                self.input = None;
            }
            Ok(n) => self.pending.extend_from_slice(&self.buf[..n]),
            Err(e) if is_retry(&e) => {}
            Err(e) => return Err(Error::io("read stdin", e)),
        }
        Ok(())
    }

    /// Writes as much pending input as the child's pipe accepts.
    fn flush_pending(&mut self) -> Result<()> {
        let Some(to_child) = self.to_child.as_mut() else {
            return Ok(());
        };
        while !self.pending.is_empty() {
            match to_child.write(&self.pending) {
                Ok(n) => {
                    self.pending.drain(..n);
                    self.bytes_in += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(dropped = self.pending.len(), "child closed its stdin");
                    self.pending.clear();
                    self.to_child = None;
                    self.input = None;
                    return Ok(());
                }
                Err(e) => return Err(Error::io("write child stdin", e)),
            }
        }
        if self.input.is_none() {
            // All input delivered; let the child see end-of-input.
            self.to_child = None;
        }
        Ok(())
    }

    /// Forwards everything the child has written so far.
    fn drain_outbound(&mut self) -> Result<()> {
        if self.outbound_done {
            return Ok(());
        }
        loop {
            match self.from_child.read(&mut self.buf) {
                Ok(0) => {
                    self.outbound_done = true;
                    break;
                }
                Ok(n) => {
                    self.output.write_all(&self.buf[..n]).context("write stdout")?;
                    self.bytes_out += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::io("read child stdout", e)),
            }
        }
        self.output.flush().context("flush stdout")
    }

    /// Drains the child's stdout after it has been reaped.
    fn drain_to_end(&mut self) -> Result<()> {
        self.drain_outbound()
    }
}

/// Errors that mean "nothing right now, try again later".
fn is_retry(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Shared stop flag, set from signal handlers.
pub fn stop_flag() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}
