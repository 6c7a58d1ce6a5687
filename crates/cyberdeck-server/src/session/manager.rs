//! Terminal lifecycle management.
//!
//! Tracks the live terminal for each session id: creation (idempotent),
//! explicit close, and reaping when the shell ends on its own.

use super::pty::{PtyHandle, PtyWriter, TerminalOptions};
use super::pump::{OutputPump, OutputSink, PumpExit};
use cyberdeck_core::{DeckResult, ServerFrame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A live terminal: the PTY plus the token that stops its pump.
struct Terminal {
    terminal_id: u64,
    pty: PtyHandle,
    cancel: CancellationToken,
    exit_rx: watch::Receiver<Option<PumpExit>>,
}

impl Terminal {
    /// Stop the pump and release the PTY. Teardown order matters: the pump
    /// is told first and discovers the closed descriptor on its next poll.
    fn shutdown(self, session_id: &str) {
        self.cancel.cancel();
        self.pty.terminate(session_id);
    }

    fn handle(&self, created: bool) -> TerminalHandle {
        TerminalHandle {
            terminal_id: self.terminal_id,
            pid: self.pty.pid(),
            created,
            exit_rx: self.exit_rx.clone(),
        }
    }
}

/// Caller's view of a terminal returned by [`PtyProcessManager::open`].
#[derive(Debug, Clone)]
pub struct TerminalHandle {
    /// Process-unique; a reopened session gets a new one.
    pub terminal_id: u64,
    pub pid: Option<u32>,
    /// This call spawned the terminal (false when it already existed).
    pub created: bool,
    exit_rx: watch::Receiver<Option<PumpExit>>,
}

impl TerminalHandle {
    /// Wait until this terminal's pump has stopped.
    pub async fn pump_exited(&mut self) -> PumpExit {
        loop {
            if let Some(exit) = self.exit_rx.borrow_and_update().clone() {
                return exit;
            }
            if self.exit_rx.changed().await.is_err() {
                return self
                    .exit_rx
                    .borrow()
                    .clone()
                    .unwrap_or(PumpExit::Cancelled);
            }
        }
    }
}

type TerminalMap = Arc<Mutex<HashMap<String, Terminal>>>;

/// Spawns and terminates shell terminals keyed by session id.
#[derive(Clone)]
pub struct PtyProcessManager {
    terminals: TerminalMap,
    options: Arc<TerminalOptions>,
    sink: Arc<dyn OutputSink>,
    next_terminal_id: Arc<AtomicU64>,
}

impl PtyProcessManager {
    pub fn new(options: TerminalOptions, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            terminals: Arc::new(Mutex::new(HashMap::new())),
            options: Arc::new(options),
            sink,
            next_terminal_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open the terminal for `session_id`, or return the one already running.
    ///
    /// On spawn failure nothing is registered.
    pub async fn open(&self, session_id: &str) -> DeckResult<TerminalHandle> {
        let mut terminals = self.terminals.lock().await;
        if let Some(existing) = terminals.get(session_id) {
            debug!(session_id, terminal_id = existing.terminal_id, "terminal already open");
            return Ok(existing.handle(false));
        }

        let pty = PtyHandle::spawn(&self.options)?;
        let reader = match pty.clone_read_fd() {
            Ok(reader) => reader,
            Err(e) => {
                pty.terminate(session_id);
                return Err(e);
            }
        };

        let terminal_id = self.next_terminal_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);

        let pump = OutputPump::new(
            session_id.to_string(),
            reader,
            self.options.poll_interval,
            self.options.read_chunk_size,
            cancel.clone(),
            self.sink.clone(),
        );
        self.spawn_supervisor(session_id.to_string(), terminal_id, pump, exit_tx);

        let terminal = Terminal {
            terminal_id,
            pty,
            cancel,
            exit_rx,
        };
        let handle = terminal.handle(true);
        info!(session_id, terminal_id, pid = handle.pid, "terminal opened");
        terminals.insert(session_id.to_string(), terminal);
        Ok(handle)
    }

    /// Run the pump on the blocking pool and reap the terminal if the shell
    /// ends on its own.
    fn spawn_supervisor(
        &self,
        session_id: String,
        terminal_id: u64,
        pump: OutputPump,
        exit_tx: watch::Sender<Option<PumpExit>>,
    ) {
        let terminals = self.terminals.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let exit = match tokio::task::spawn_blocking(move || pump.run()).await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "output pump panicked");
                    PumpExit::ReadError(e.to_string())
                }
            };

            if exit.needs_teardown() {
                let reaped = {
                    let mut map = terminals.lock().await;
                    match map.get(&session_id) {
                        Some(t) if t.terminal_id == terminal_id => map.remove(&session_id),
                        _ => None,
                    }
                };
                if let Some(terminal) = reaped {
                    info!(session_id = %session_id, terminal_id, ?exit, "terminal ended");
                    terminal.shutdown(&session_id);
                    sink.emit(&session_id, ServerFrame::TerminalExit {});
                }
            }

            let _ = exit_tx.send(Some(exit));
        });
    }

    /// Close the terminal for `session_id`. Best-effort; never fails.
    ///
    /// Returns whether a terminal was registered.
    pub async fn close(&self, session_id: &str) -> bool {
        let removed = self.terminals.lock().await.remove(session_id);
        match removed {
            Some(terminal) => {
                info!(session_id, terminal_id = terminal.terminal_id, "terminal closed");
                terminal.shutdown(session_id);
                true
            }
            None => {
                debug!(session_id, "close for unknown terminal");
                false
            }
        }
    }

    /// Close every terminal (server shutdown) and wait, bounded, for their
    /// pumps to stop.
    pub async fn close_all(&self) {
        let drained: Vec<(String, Terminal)> = self.terminals.lock().await.drain().collect();
        let mut handles = Vec::with_capacity(drained.len());
        for (session_id, terminal) in drained {
            handles.push((session_id.clone(), terminal.handle(false)));
            terminal.shutdown(&session_id);
        }

        let bound = self.options.poll_interval.saturating_mul(10);
        for (session_id, mut handle) in handles {
            match tokio::time::timeout(bound, handle.pump_exited()).await {
                Ok(exit) => debug!(session_id = %session_id, ?exit, "pump stopped on shutdown"),
                Err(_) => warn!(session_id = %session_id, "pump still running after shutdown"),
            }
        }
    }

    /// Resize the terminal for `session_id`; a missing terminal is ignored.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> DeckResult<()> {
        let terminals = self.terminals.lock().await;
        match terminals.get(session_id) {
            Some(t) => t.pty.resize(cols, rows),
            None => Ok(()),
        }
    }

    /// Input writer for `session_id`, if a terminal is open.
    pub async fn writer(&self, session_id: &str) -> Option<PtyWriter> {
        self.terminals
            .lock()
            .await
            .get(session_id)
            .map(|t| t.pty.writer())
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.terminals.lock().await.contains_key(session_id)
    }

    pub async fn count(&self) -> usize {
        self.terminals.lock().await.len()
    }
}
