//! Frames exchanged with the browser terminal.
//!
//! Every frame is a JSON object with a `type` discriminator, e.g.
//! `{"type":"terminal_input","data":"ls\n"}`. Event names match the
//! browser client's socket events.

use serde::{Deserialize, Serialize};

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keystrokes or pasted text for the shell.
    TerminalInput { data: String },
    /// The client's terminal widget changed size.
    TerminalResize { cols: u16, rows: u16 },
    /// Connection health check.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
    /// Ask for the state of this connection's session.
    Status,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// The connection was admitted and holds the terminal.
    Connected { session_id: String },
    /// A chunk of shell output.
    TerminalOutput { data: String },
    /// The shell exited on its own.
    TerminalExit {},
    Error { code: u16, message: String },
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
        server_time: u64,
    },
    Status {
        session_id: String,
        active: bool,
        expires_in: u64,
        server_time: u64,
    },
    /// The server is going away.
    Shutdown { reason: String },
}

impl ServerFrame {
    /// Build an `error` frame from a [`crate::DeckError`].
    pub fn error(err: &crate::DeckError) -> Self {
        ServerFrame::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
