//! Rooms: per-session fan-out of server frames to connections.
//!
//! Each admitted connection joins the room named by its session id and gets
//! an unbounded receiver. Output emitted to a room reaches only that room's
//! connections, in emission order.

use crate::session::OutputSink;
use cyberdeck_core::ServerFrame;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

type Rooms = HashMap<String, HashMap<u64, mpsc::UnboundedSender<ServerFrame>>>;

/// Registry of rooms and their member connections.
#[derive(Default)]
pub struct RoomHub {
    rooms: RwLock<Rooms>,
    next_conn_id: AtomicU64,
}

impl RoomHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to `session_id`'s room.
    ///
    /// Returns the connection id (for [`RoomHub::leave`]) and the receiver
    /// the connection drains into its socket.
    pub fn join(&self, session_id: &str) -> (u64, mpsc::UnboundedReceiver<ServerFrame>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .insert(conn_id, tx);
        debug!(session_id, conn_id, "joined room");
        (conn_id, rx)
    }

    /// Remove a connection and return how many remain in its room.
    /// Empty rooms are dropped.
    pub fn leave(&self, session_id: &str, conn_id: u64) -> usize {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let remaining = match rooms.get_mut(session_id) {
            Some(members) => {
                members.remove(&conn_id);
                members.len()
            }
            None => 0,
        };
        if remaining == 0 {
            rooms.remove(session_id);
        }
        debug!(session_id, conn_id, remaining, "left room");
        remaining
    }

    /// Send `frame` to every connection in every room.
    pub fn broadcast(&self, frame: &ServerFrame) {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        for tx in rooms.values().flat_map(|members| members.values()) {
            let _ = tx.send(frame.clone());
        }
    }

    pub fn members(&self, session_id: &str) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map_or(0, |m| m.len())
    }
}

impl OutputSink for RoomHub {
    fn emit(&self, session_id: &str, frame: ServerFrame) {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = rooms.get(session_id) else {
            return;
        };
        for tx in members.values() {
            // A closed receiver means the connection is going away.
            let _ = tx.send(frame.clone());
        }
    }
}
