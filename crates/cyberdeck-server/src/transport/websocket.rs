//! WebSocket listener using tokio-tungstenite.
//!
//! The access gate runs inside the upgrade callback: a denied address gets an
//! HTTP 403 and never reaches session logic. Accepted connections are handed
//! to the server over a channel, together with the client address and the
//! session id the client asked for, if any.

use crate::access::{AccessDecision, AccessGate};
use cyberdeck_core::{
    decode_frame, encode_frame, is_valid_session_id, ClientFrame, DeckError, DeckResult, ServerFrame,
};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Header set by a reverse proxy in front of the server.
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Maximum inbound message size (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// Protocol limits applied while reading, before a message is buffered.
fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_WS_FRAME_SIZE);
    config.max_frame_size = Some(MAX_WS_FRAME_SIZE);
    config
}

/// A handle to an accepted, gate-approved WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WebSocketStream<TcpStream>,
    /// TCP peer address.
    pub remote_addr: SocketAddr,
    /// Address the gate admitted (the peer, or `X-Real-IP` when trusted).
    pub client_ip: IpAddr,
    /// Value of the `session_id` query parameter.
    pub requested_session_id: Option<String>,
}

/// What the upgrade callback learned about an admitted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub client_ip: IpAddr,
    pub requested_session_id: Option<String>,
}

/// Listener settings shared by every accepted connection.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub gate: Arc<AccessGate>,
    pub trust_real_ip_header: bool,
}

/// Start the WebSocket listener.
///
/// Returns the bound address (useful when binding port 0) and a receiver
/// that yields admitted connections.
pub async fn start_listener(
    bind_addr: SocketAddr,
    options: ListenerOptions,
) -> DeckResult<(SocketAddr, mpsc::Receiver<WebSocketConnection>)> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| DeckError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener.local_addr()?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        if let Some(conn) = accept_connection(stream, addr, &options).await {
                            if tx.send(conn).await.is_err() {
                                warn!("WebSocket connection channel closed");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    });

    Ok((local_addr, rx))
}

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    options: &ListenerOptions,
) -> Option<WebSocketConnection> {
    let mut admitted = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let admission = admit_request(req, addr, &options.gate, options.trust_real_ip_header)?;
        admitted = Some(admission);
        Ok(resp)
    };

    let handshake =
        tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config())).await;
    match handshake {
        Ok(ws_stream) => {
            let admission = admitted?;
            debug!(remote = %addr, client_ip = %admission.client_ip, "WebSocket connection accepted");
            Some(WebSocketConnection {
                ws_stream,
                remote_addr: addr,
                client_ip: admission.client_ip,
                requested_session_id: admission.requested_session_id,
            })
        }
        Err(e) => {
            debug!(remote = %addr, error = %e, "WebSocket handshake failed");
            None
        }
    }
}

/// Decide whether an upgrade request may proceed.
pub fn admit_request(
    req: &Request,
    peer: SocketAddr,
    gate: &AccessGate,
    trust_real_ip_header: bool,
) -> Result<Admission, ErrorResponse> {
    let claimed = if trust_real_ip_header {
        req.headers()
            .get(REAL_IP_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
    } else {
        None
    };
    let client = claimed.unwrap_or_else(|| peer.ip().to_string());

    let client_ip = match gate.admit(&client) {
        AccessDecision::Allow(ip) => ip,
        AccessDecision::Deny { reason } => {
            warn!(remote = %peer, client = %client, %reason, "connection rejected");
            return Err(reject(StatusCode::FORBIDDEN, "Access denied"));
        }
    };

    let requested_session_id = query_param(req.uri().query(), "session_id");
    if let Some(id) = &requested_session_id {
        if !is_valid_session_id(id) {
            warn!(remote = %peer, "connection rejected, malformed session id");
            return Err(reject(StatusCode::BAD_REQUEST, "Invalid session id"));
        }
    }

    Ok(Admission {
        client_ip,
        requested_session_id,
    })
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(message.to_string()));
    *resp.status_mut() = status;
    resp
}

/// First value of `key` in a raw query string. An empty value counts as absent.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Send one server frame as a JSON text message.
pub async fn ws_send_frame(
    ws: &mut WebSocketStream<TcpStream>,
    frame: &ServerFrame,
) -> DeckResult<()> {
    let text = encode_frame(frame)?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| DeckError::Transport(format!("WS send failed: {e}")))
}

/// Receive the next client frame.
///
/// Returns `Ok(None)` when the connection is closed. A text message that does
/// not decode yields `Some(Err(..))` so the caller can report it and keep
/// the connection. Binary messages are ignored; a message over
/// `MAX_WS_FRAME_SIZE` fails the read.
pub async fn ws_recv_frame(
    ws: &mut WebSocketStream<TcpStream>,
) -> DeckResult<Option<DeckResult<ClientFrame>>> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return Ok(Some(decode_frame::<ClientFrame>(&text)));
            }
            Some(Ok(Message::Close(_))) => return Ok(None),
            Some(Ok(Message::Ping(payload))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                return Err(DeckError::Transport(format!("WS recv failed: {e}")));
            }
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(ip: &str) -> SocketAddr {
        SocketAddr::new(ip.parse().unwrap(), 50000)
    }

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn allowed_peer_without_session_id() {
        let gate = AccessGate::default();
        let admission = admit_request(&request("/"), peer("192.168.1.20"), &gate, false).unwrap();
        assert_eq!(admission.client_ip, "192.168.1.20".parse::<IpAddr>().unwrap());
        assert_eq!(admission.requested_session_id, None);
    }

    #[test]
    fn public_peer_is_forbidden() {
        let gate = AccessGate::default();
        let err = admit_request(&request("/"), peer("8.8.8.8"), &gate, false).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn session_id_is_taken_from_the_query() {
        let gate = AccessGate::default();
        let admission = admit_request(
            &request("/socket?foo=1&session_id=abc_123-X"),
            peer("10.1.2.3"),
            &gate,
            false,
        )
        .unwrap();
        assert_eq!(admission.requested_session_id.as_deref(), Some("abc_123-X"));
    }

    #[test]
    fn malformed_session_id_is_a_bad_request() {
        let gate = AccessGate::default();
        let err = admit_request(
            &request("/?session_id=a%20b"),
            peer("10.1.2.3"),
            &gate,
            false,
        )
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn denied_peer_is_rejected_before_session_id_parsing() {
        let gate = AccessGate::default();
        let err = admit_request(&request("/?session_id=!!"), peer("1.1.1.1"), &gate, false)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn real_ip_header_only_when_trusted() {
        let gate = AccessGate::default();
        let req = Request::builder()
            .uri("/")
            .header("X-Real-IP", "8.8.8.8")
            .body(())
            .unwrap();

        let admission = admit_request(&req, peer("127.0.0.1"), &gate, false).unwrap();
        assert_eq!(admission.client_ip, "127.0.0.1".parse::<IpAddr>().unwrap());

        let err = admit_request(&req, peer("127.0.0.1"), &gate, true).unwrap_err();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn reads_are_capped_at_one_mebibyte() {
        let config = ws_config();
        assert_eq!(config.max_message_size, Some(MAX_WS_FRAME_SIZE));
        assert_eq!(config.max_frame_size, Some(MAX_WS_FRAME_SIZE));
    }

    #[test]
    fn empty_session_id_counts_as_absent() {
        assert_eq!(query_param(Some("session_id="), "session_id"), None);
        assert_eq!(query_param(Some("session_id"), "session_id"), None);
        assert_eq!(query_param(None, "session_id"), None);
        assert_eq!(
            query_param(Some("a=1&session_id=x&session_id=y"), "session_id").as_deref(),
            Some("x")
        );
    }
}
