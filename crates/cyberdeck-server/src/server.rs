//! Core server: connection admission, frame dispatch and teardown.
//!
//! Wires the access gate, the session registry, the terminal manager, the
//! input router and the room hub together behind the WebSocket transport.

use crate::access::AccessGate;
use crate::config::ServerConfig;
use crate::rooms::RoomHub;
use crate::session::{InputRouter, PtyProcessManager, SessionRegistry, TerminalHandle};
use crate::transport::websocket::{self, ListenerOptions, WebSocketConnection};
use cyberdeck_core::{
    generate_session_id, unix_now, ClientFrame, DeckError, DeckResult, ServerFrame,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

/// An admitted connection's place in the server.
pub struct Admitted {
    pub session_id: String,
    pub conn_id: u64,
    pub frames: mpsc::UnboundedReceiver<ServerFrame>,
    pub terminal: TerminalHandle,
}

/// The cyberdeck server.
pub struct DeckServer {
    config: ServerConfig,
    gate: Arc<AccessGate>,
    sessions: Arc<SessionRegistry>,
    terminals: PtyProcessManager,
    input: InputRouter,
    rooms: Arc<RoomHub>,
    /// Serialises room membership changes with terminal open/close.
    admission: Mutex<()>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DeckServer {
    pub fn new(config: ServerConfig) -> Self {
        let gate = Arc::new(AccessGate::new(config.allowed_networks.clone()));
        let sessions = Arc::new(SessionRegistry::new(config.session_ttl));
        let rooms = Arc::new(RoomHub::new());
        let terminals = PtyProcessManager::new(config.terminal.clone(), rooms.clone());
        let input = InputRouter::new(terminals.clone());

        Self {
            config,
            gate,
            sessions,
            terminals,
            input,
            rooms,
            admission: Mutex::new(()),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Bind the WebSocket listener.
    pub async fn listen(
        &self,
    ) -> DeckResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
        let options = ListenerOptions {
            gate: self.gate.clone(),
            trust_real_ip_header: self.config.trust_real_ip_header,
        };
        websocket::start_listener(self.config.bind_addr, options).await
    }

    /// Bind and serve until the listener goes away.
    pub async fn run(self: Arc<Self>) -> DeckResult<()> {
        let (_, ws_rx) = self.listen().await?;
        self.serve(ws_rx).await;
        Ok(())
    }

    /// Accept connections from a bound listener.
    pub async fn serve(self: Arc<Self>, mut ws_rx: mpsc::Receiver<WebSocketConnection>) {
        info!(
            ttl = self.config.session_ttl,
            shell = %self.config.terminal.shell.display(),
            "cyberdeck-server ready"
        );

        while let Some(ws_conn) = ws_rx.recv().await {
            let srv = self.clone();
            tokio::spawn(async move {
                if let Err(e) = srv.handle_websocket(ws_conn).await {
                    warn!(error = %e, "WebSocket connection error");
                }
            });
        }

        info!("listener closed");
    }

    /// Admit a client: gate, claim, join the room, open the terminal.
    ///
    /// Without a requested id a fresh one is assigned. If the terminal cannot
    /// be spawned the claim is given back.
    pub async fn connect(
        &self,
        client_ip: IpAddr,
        requested_session_id: Option<String>,
    ) -> DeckResult<Admitted> {
        if !self.gate.is_allowed_addr(client_ip) {
            return Err(DeckError::AccessDenied(format!("IP {client_ip} not allowed")));
        }

        let session_id = requested_session_id.unwrap_or_else(generate_session_id);
        let _admission = self.admission.lock().await;
        self.sessions
            .claim_or_renew(&session_id, client_ip, unix_now())?;

        let (conn_id, frames) = self.rooms.join(&session_id);
        let terminal = match self.terminals.open(&session_id).await {
            Ok(terminal) => terminal,
            Err(e) => {
                self.rooms.leave(&session_id, conn_id);
                self.sessions.release(&session_id);
                return Err(e);
            }
        };

        Ok(Admitted {
            session_id,
            conn_id,
            frames,
            terminal,
        })
    }

    /// Tear down a connection: leave the room and, once the room is empty,
    /// close the terminal.
    ///
    /// A reconnect that arrives before the old socket is gone keeps the
    /// running shell.
    pub async fn disconnect(&self, session_id: &str, conn_id: u64) {
        let _admission = self.admission.lock().await;
        let remaining = self.rooms.leave(session_id, conn_id);
        info!(session_id, conn_id, remaining, "client disconnected");
        if remaining > 0 {
            return;
        }
        self.terminals.close(session_id).await;
        if self.config.release_on_disconnect {
            self.sessions.release(session_id);
        }
    }

    /// Notify every client and close every terminal.
    pub async fn shutdown(&self) {
        info!("broadcasting shutdown to connected clients");
        self.rooms.broadcast(&ServerFrame::Shutdown {
            reason: "server shutdown".into(),
        });
        let _ = self.shutdown_tx.send(());
        self.terminals.close_all().await;
    }

    async fn handle_websocket(&self, mut conn: WebSocketConnection) -> DeckResult<()> {
        let remote = conn.remote_addr;
        info!(remote = %remote, client_ip = %conn.client_ip, "handling WebSocket connection");

        let requested = conn.requested_session_id.take();
        let admitted = match self.connect(conn.client_ip, requested).await {
            Ok(admitted) => admitted,
            Err(e) => {
                let _ = websocket::ws_send_frame(&mut conn.ws_stream, &ServerFrame::error(&e)).await;
                let _ = conn.ws_stream.close(None).await;
                return Err(e);
            }
        };

        let Admitted {
            session_id,
            conn_id,
            mut frames,
            terminal,
        } = admitted;
        info!(
            remote = %remote,
            session_id = %session_id,
            terminal_id = terminal.terminal_id,
            created = terminal.created,
            "client connected"
        );

        let ack = ServerFrame::Connected {
            session_id: session_id.clone(),
        };
        let result = match websocket::ws_send_frame(&mut conn.ws_stream, &ack).await {
            Ok(()) => self.session_loop(&mut conn, &session_id, &mut frames).await,
            Err(e) => Err(e),
        };

        self.disconnect(&session_id, conn_id).await;
        result
    }

    /// Per-connection loop: room frames out, client frames in.
    async fn session_loop(
        &self,
        conn: &mut WebSocketConnection,
        session_id: &str,
        frames: &mut mpsc::UnboundedReceiver<ServerFrame>,
    ) -> DeckResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    debug!(session_id, "shutdown signal received, notifying WebSocket client");
                    while let Ok(frame) = frames.try_recv() {
                        websocket::ws_send_frame(&mut conn.ws_stream, &frame).await?;
                    }
                    break;
                }

                Some(frame) = frames.recv() => {
                    websocket::ws_send_frame(&mut conn.ws_stream, &frame).await?;
                    if matches!(frame, ServerFrame::TerminalExit {}) {
                        debug!(session_id, "terminal ended, closing connection");
                        break;
                    }
                }

                ws_result = websocket::ws_recv_frame(&mut conn.ws_stream) => {
                    match ws_result {
                        Ok(Some(Ok(frame))) => match self.dispatch(session_id, conn.client_ip, frame).await {
                            Ok(Some(reply)) => {
                                websocket::ws_send_frame(&mut conn.ws_stream, &reply).await?;
                            }
                            Ok(None) => {}
                            Err(e @ DeckError::SessionConflict) => {
                                warn!(session_id, "session superseded, closing connection");
                                websocket::ws_send_frame(&mut conn.ws_stream, &ServerFrame::error(&e)).await?;
                                break;
                            }
                            Err(e) => {
                                websocket::ws_send_frame(&mut conn.ws_stream, &ServerFrame::error(&e)).await?;
                            }
                        },
                        Ok(Some(Err(e))) => {
                            debug!(session_id, error = %e, "malformed client frame");
                            websocket::ws_send_frame(&mut conn.ws_stream, &ServerFrame::error(&e)).await?;
                        }
                        Ok(None) => {
                            debug!(session_id, "WebSocket session ended (peer closed)");
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(session_id, error = %e, "WebSocket session ended");
                            return Ok(());
                        }
                    }
                }
            }
        }

        let _ = conn.ws_stream.close(None).await;
        Ok(())
    }

    /// Handle one client frame. Every frame renews the session's claim first.
    async fn dispatch(
        &self,
        session_id: &str,
        client_ip: IpAddr,
        frame: ClientFrame,
    ) -> DeckResult<Option<ServerFrame>> {
        let now = unix_now();
        self.sessions.claim_or_renew(session_id, client_ip, now)?;

        match frame {
            ClientFrame::TerminalInput { data } => {
                let delivery = self.input.send(session_id, data.as_bytes()).await;
                debug!(session_id, bytes = data.len(), ?delivery, "terminal input");
                Ok(None)
            }
            ClientFrame::TerminalResize { cols, rows } => {
                if let Err(e) = self.terminals.resize(session_id, cols, rows).await {
                    debug!(session_id, cols, rows, error = %e, "resize failed");
                }
                Ok(None)
            }
            ClientFrame::Ping { timestamp } => Ok(Some(ServerFrame::Pong {
                timestamp,
                server_time: now,
            })),
            ClientFrame::Status => {
                let expires_in = self
                    .sessions
                    .snapshot()
                    .filter(|r| r.id == session_id)
                    .map_or(0, |r| r.expires_at.saturating_sub(now));
                Ok(Some(ServerFrame::Status {
                    session_id: session_id.to_string(),
                    active: self.sessions.is_current(session_id, now),
                    expires_in,
                    server_time: now,
                }))
            }
        }
    }
}
