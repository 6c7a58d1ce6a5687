//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal pair, runs the shell on the follower side as the
//! leader of its own process group, and exposes input writing, a read view of
//! the controller for the output pump, resize, and teardown.

use cyberdeck_core::{DeckError, DeckResult};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How terminals are spawned and pumped.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub shell: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Upper bound on how long the pump blocks before re-checking cancellation.
    pub poll_interval: Duration,
    pub read_chunk_size: usize,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            cols: 100,
            rows: 30,
            poll_interval: Duration::from_millis(100),
            read_chunk_size: 1024,
        }
    }
}

/// Shared handle to the controller's input side.
pub type PtyWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Outcome of one teardown step that did not fail unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Done,
    /// The process or descriptor was gone before we got to it.
    AlreadyGone,
}

/// Sort a teardown result into success, benign "already gone", or a real error.
pub fn classify_teardown(result: io::Result<()>) -> io::Result<Teardown> {
    match result {
        Ok(()) => Ok(Teardown::Done),
        Err(e) if is_already_gone(&e) => Ok(Teardown::AlreadyGone),
        Err(e) => Err(e),
    }
}

fn is_already_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(code) if code == libc::ESRCH || code == libc::EBADF || code == libc::ECHILD
    ) || err.kind() == io::ErrorKind::InvalidInput
}

fn log_teardown(session_id: &str, step: &str, outcome: io::Result<Teardown>) {
    match outcome {
        Ok(Teardown::Done) => debug!(session_id, step, "teardown step done"),
        Ok(Teardown::AlreadyGone) => debug!(session_id, step, "teardown step skipped, already gone"),
        Err(e) => warn!(session_id, step, error = %e, "teardown step failed"),
    }
}

/// Signal the process group led by `pid`, falling back to the pid alone.
fn signal_process_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if pid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid pid"));
    }
    // SAFETY: plain kill(2) calls with integer arguments; errno is read
    // immediately after the failing call.
    unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(());
        }
        if libc::kill(pid, signal) == 0 {
            return Ok(());
        }
    }
    Err(io::Error::last_os_error())
}

/// A managed PTY instance: the controller side and the shell child.
pub struct PtyHandle {
    /// The controller side (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: PtyWriter,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Spawn `options.shell` on a fresh PTY of `options.cols` x `options.rows`.
    pub fn spawn(options: &TerminalOptions) -> DeckResult<Self> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| DeckError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.env("TERM", "xterm-256color");

        // portable-pty runs the child under setsid(), so it leads its own
        // session and process group.
        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            DeckError::Spawn(format!(
                "failed to spawn {}: {e}",
                options.shell.display()
            ))
        })?;
        let pid = child.process_id();
        // Only the child may hold the follower open, or the controller never
        // reports end-of-stream when the shell exits.
        drop(pair.slave);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| DeckError::Spawn(format!("failed to take PTY writer: {e}")))?;

        info!(pid, cols = options.cols, rows = options.rows, "PTY spawned");

        Ok(Self {
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            child,
            pid,
        })
    }

    /// Duplicate the controller descriptor for the output pump.
    ///
    /// The pump reads through its own descriptor, so closing the terminal
    /// never pulls a descriptor number out from under an in-flight poll.
    pub fn clone_read_fd(&self) -> DeckResult<File> {
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        let raw = master
            .as_raw_fd()
            .ok_or_else(|| DeckError::Spawn("PTY controller has no descriptor".into()))?;
        // SAFETY: `raw` is a live descriptor owned by the MasterPty we hold
        // locked; F_DUPFD_CLOEXEC only creates a new descriptor.
        let dup = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(DeckError::Io(io::Error::last_os_error()));
        }
        // SAFETY: `dup` is a fresh descriptor that nothing else owns.
        Ok(unsafe { File::from_raw_fd(dup) })
    }

    /// Clone of the input writer for use outside the terminal map lock.
    pub fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    /// Write to the PTY input (blocking; call from a spawn_blocking context).
    pub fn write_blocking(writer: &PtyWriter, data: &[u8]) -> io::Result<()> {
        let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(data)?;
        writer.flush()
    }

    /// Resize the PTY window.
    pub fn resize(&self, cols: u16, rows: u16) -> DeckResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self.master.lock().unwrap_or_else(PoisonError::into_inner);
        master
            .resize(size)
            .map_err(|e| DeckError::Other(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Tear the PTY down: hang up the shell's process group, release the
    /// controller, then reap the child in the background.
    ///
    /// Never fails; unexpected errors are logged.
    pub fn terminate(self, session_id: &str) {
        let Self {
            master,
            writer,
            mut child,
            pid,
        } = self;

        match pid {
            Some(pid) => log_teardown(
                session_id,
                "sighup",
                classify_teardown(signal_process_group(pid, libc::SIGHUP)),
            ),
            None => debug!(session_id, "no pid recorded, skipping SIGHUP"),
        }

        drop(writer);
        drop(master);

        // kill() escalates if SIGHUP was ignored; wait() reaps the zombie.
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            let killed = match child.try_wait() {
                Ok(Some(_)) => Ok(Teardown::AlreadyGone),
                _ => classify_teardown(child.kill()),
            };
            log_teardown(&session_id, "kill", killed);
            match child.wait() {
                Ok(status) => debug!(session_id = %session_id, ?status, "shell reaped"),
                Err(e) => log_teardown(&session_id, "wait", classify_teardown(Err(e))),
            }
        });
    }
}
