//! Output pump: streams a terminal's output to its session's room.
//!
//! One pump runs per terminal on the blocking pool. It waits for readability
//! with a bounded poll so cancellation is observed within one interval, reads
//! a chunk, decodes it permissively, and emits it. It never writes to the
//! terminal and never closes anything but its own read descriptor.

use cyberdeck_core::{ServerFrame, Utf8ChunkDecoder};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Where pump output goes. Delivery is fire-and-forget.
pub trait OutputSink: Send + Sync {
    /// Deliver `frame` to the connections in `session_id`'s room only.
    fn emit(&self, session_id: &str, frame: ServerFrame);
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The terminal was closed and the token cancelled.
    Cancelled,
    /// A read returned zero bytes.
    EndOfStream,
    /// Polling or reading the controller failed (EIO once the shell is gone).
    ReadError(String),
}

impl PumpExit {
    /// Whether the terminal ended on its own rather than by `close`.
    pub fn needs_teardown(&self) -> bool {
        !matches!(self, PumpExit::Cancelled)
    }
}

/// The read loop for one terminal.
pub struct OutputPump {
    session_id: String,
    reader: File,
    poll_interval: Duration,
    chunk_size: usize,
    cancel: CancellationToken,
    sink: Arc<dyn OutputSink>,
}

impl OutputPump {
    pub fn new(
        session_id: String,
        reader: File,
        poll_interval: Duration,
        chunk_size: usize,
        cancel: CancellationToken,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self {
            session_id,
            reader,
            poll_interval,
            chunk_size: chunk_size.max(1),
            cancel,
            sink,
        }
    }

    /// Run until cancelled, end-of-stream, or a read error (blocking).
    pub fn run(mut self) -> PumpExit {
        let mut decoder = Utf8ChunkDecoder::new();
        let mut buf = vec![0u8; self.chunk_size];
        let fd = self.reader.as_raw_fd();

        let exit = loop {
            if self.cancel.is_cancelled() {
                break PumpExit::Cancelled;
            }

            match wait_readable(fd, self.poll_interval) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break PumpExit::ReadError(e.to_string()),
            }

            match self.reader.read(&mut buf) {
                Ok(0) => break PumpExit::EndOfStream,
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    self.forward(text);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(e) => break PumpExit::ReadError(e.to_string()),
            }
        };

        if exit.needs_teardown() {
            let tail = decoder.finish();
            self.forward(tail);
        }
        debug!(session_id = %self.session_id, ?exit, "output pump stopped");
        exit
    }

    fn forward(&self, text: String) {
        if text.is_empty() {
            return;
        }
        self.sink
            .emit(&self.session_id, ServerFrame::TerminalOutput { data: text });
    }
}

/// Wait up to `timeout` for `fd` to become readable.
///
/// Hang-up and error conditions count as readable so the following read
/// surfaces them.
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `pfd` is a valid, initialised pollfd and nfds is 1.
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if rc == 0 {
        return Ok(false);
    }
    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::FromRawFd;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Sink that records every frame per session.
    #[derive(Default)]
    pub(crate) struct CollectingSink {
        frames: Mutex<Vec<(String, ServerFrame)>>,
    }

    impl CollectingSink {
        /// Concatenated `terminal_output` text for one session.
        pub(crate) fn output_for(&self, session_id: &str) -> String {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == session_id)
                .filter_map(|(_, f)| match f {
                    ServerFrame::TerminalOutput { data } => Some(data.as_str()),
                    _ => None,
                })
                .collect()
        }

        pub(crate) fn frames_for(&self, session_id: &str) -> Vec<ServerFrame> {
            self.frames
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, _)| id == session_id)
                .map(|(_, f)| f.clone())
                .collect()
        }

        /// Poll until the session's output contains `needle`.
        pub(crate) async fn wait_for_output(
            &self,
            session_id: &str,
            needle: &str,
            timeout: Duration,
        ) -> bool {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if self.output_for(session_id).contains(needle) {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            false
        }
    }

    impl OutputSink for CollectingSink {
        fn emit(&self, session_id: &str, frame: ServerFrame) {
            self.frames
                .lock()
                .unwrap()
                .push((session_id.to_string(), frame));
        }
    }

    fn pipe() -> (File, File) {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        // SAFETY: both descriptors were just created and are owned here.
        unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) }
    }

    fn pump(reader: File, cancel: CancellationToken, sink: Arc<CollectingSink>) -> OutputPump {
        OutputPump::new(
            "s1".into(),
            reader,
            Duration::from_millis(20),
            4,
            cancel,
            sink,
        )
    }

    #[test]
    fn forwards_chunks_in_order_until_eof() {
        let (reader, mut writer) = pipe();
        let sink = Arc::new(CollectingSink::default());
        let handle = std::thread::spawn({
            let p = pump(reader, CancellationToken::new(), sink.clone());
            move || p.run()
        });

        writer.write_all(b"A").unwrap();
        writer.write_all(b"BCDEFGH").unwrap();
        writer.write_all("é!".as_bytes()).unwrap();
        drop(writer);

        assert_eq!(handle.join().unwrap(), PumpExit::EndOfStream);
        assert_eq!(sink.output_for("s1"), "ABCDEFGHé!");
        assert_eq!(sink.output_for("other"), "");
    }

    #[test]
    fn invalid_bytes_do_not_stop_the_pump() {
        let (reader, mut writer) = pipe();
        let sink = Arc::new(CollectingSink::default());
        let p = pump(reader, CancellationToken::new(), sink.clone());
        writer.write_all(b"ok\xFFok").unwrap();
        drop(writer);
        assert_eq!(p.run(), PumpExit::EndOfStream);
        assert_eq!(sink.output_for("s1"), "ok\u{FFFD}ok");
    }

    #[test]
    fn cancellation_is_observed_within_a_poll_interval() {
        let (reader, _writer) = pipe();
        let sink = Arc::new(CollectingSink::default());
        let cancel = CancellationToken::new();
        let handle = std::thread::spawn({
            let p = pump(reader, cancel.clone(), sink);
            move || p.run()
        });

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        cancel.cancel();
        assert_eq!(handle.join().unwrap(), PumpExit::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
