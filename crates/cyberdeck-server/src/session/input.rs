//! Routes client keystrokes into the session's terminal.

use super::manager::PtyProcessManager;
use super::pty::PtyHandle;
use tracing::debug;

/// What happened to one `send`. Informational only; never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Written,
    /// No terminal is open for the session.
    NoTerminal,
    /// The terminal went away mid-write (disconnect racing input).
    Dropped,
}

/// Forwards client input to the controller side of a terminal.
#[derive(Clone)]
pub struct InputRouter {
    terminals: PtyProcessManager,
}

impl InputRouter {
    pub fn new(terminals: PtyProcessManager) -> Self {
        Self { terminals }
    }

    /// Write `data` to `session_id`'s terminal.
    ///
    /// Input is never queued or retried: a missing terminal or a failed write
    /// drops the bytes.
    pub async fn send(&self, session_id: &str, data: &[u8]) -> Delivery {
        let Some(writer) = self.terminals.writer(session_id).await else {
            debug!(session_id, bytes = data.len(), "input for missing terminal dropped");
            return Delivery::NoTerminal;
        };

        let data = data.to_vec();
        let result =
            tokio::task::spawn_blocking(move || PtyHandle::write_blocking(&writer, &data)).await;
        match result {
            Ok(Ok(())) => Delivery::Written,
            Ok(Err(e)) => {
                debug!(session_id, error = %e, "terminal write failed, input dropped");
                Delivery::Dropped
            }
            Err(e) => {
                debug!(session_id, error = %e, "terminal write task failed, input dropped");
                Delivery::Dropped
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::pump::tests::CollectingSink;
    use crate::session::TerminalOptions;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn router() -> (PtyProcessManager, InputRouter) {
        let options = TerminalOptions {
            shell: PathBuf::from("/bin/sh"),
            ..TerminalOptions::default()
        };
        let mgr = PtyProcessManager::new(options, Arc::new(CollectingSink::default()));
        let router = InputRouter::new(mgr.clone());
        (mgr, router)
    }

    #[tokio::test]
    async fn missing_terminal_is_noop() {
        let (_mgr, router) = router();
        assert_eq!(router.send("ghost", b"ls\n").await, Delivery::NoTerminal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_reaches_open_terminal() {
        let (mgr, router) = router();
        mgr.open("s1").await.unwrap();
        assert_eq!(router.send("s1", b"true\n").await, Delivery::Written);
        mgr.close("s1").await;
        assert_eq!(router.send("s1", b"true\n").await, Delivery::NoTerminal);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn send_racing_close_never_errors() {
        let (mgr, router) = router();
        mgr.open("s1").await.unwrap();

        let senders: Vec<_> = (0..16)
            .map(|i| {
                let router = router.clone();
                tokio::spawn(async move { router.send("s1", format!("echo {i}\n").as_bytes()).await })
            })
            .collect();
        let closer = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.close("s1").await })
        };

        for s in senders {
            // Any Delivery value is fine; the point is no panic and no error.
            let _ = s.await.unwrap();
        }
        assert!(closer.await.unwrap());
        assert!(!mgr.contains("s1").await);
    }
}
