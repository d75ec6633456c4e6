use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config;
use crate::event::DaemonEvent;
use crate::session::{Outbound, SessionHandle};

/// Port range existing protocol clients probe, inclusive.
pub const PORT_RANGE_START: u16 = 6463;
pub const PORT_RANGE_END: u16 = 6472;

/// Connection parameters carried as query parameters on the upgrade request
/// rather than as a protocol frame.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConnectParams {
    pub v: String,
    pub encoding: String,
    pub client_id: String,
}

impl ConnectParams {
    /// Only `v=1` with JSON encoding is served. An empty client id is
    /// accepted here, unlike on the native transport.
    pub fn acceptable(&self) -> bool {
        self.v == "1" && self.encoding == "json"
    }
}

pub fn parse_params(query: Option<&str>) -> ConnectParams {
    let mut params = ConnectParams::default();
    if let Some(query) = query {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "v" => params.v = value.into_owned(),
                "encoding" => params.encoding = value.into_owned(),
                "client_id" => params.client_id = value.into_owned(),
                _ => {}
            }
        }
    }
    params
}

/// WebSocket server bound to the first free port in the range.
pub struct WsServer {
    listener: TcpListener,
}

impl WsServer {
    /// Tries ports sequentially; address-in-use moves to the next port, any
    /// other bind failure is fatal, and an exhausted range is fatal.
    pub async fn bind() -> Result<Self> {
        for port in PORT_RANGE_START..=PORT_RANGE_END {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => {
                    println!("[ws] Listening on port {port}");
                    return Ok(Self { listener });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to bind WebSocket port {port}"))
                }
            }
        }
        bail!("no free WebSocket port in {PORT_RANGE_START}-{PORT_RANGE_END}")
    }

    pub async fn serve(self, events: mpsc::Sender<DaemonEvent>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(run_connection(stream, events.clone()));
                }
                Err(e) => {
                    eprintln!("[ws] Accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Runs one WebSocket connection to completion. There is no handshake frame:
/// acceptance is decided from the upgrade query parameters and `connection`
/// is emitted immediately afterwards.
pub async fn run_connection<S>(stream: S, events: mpsc::Sender<DaemonEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut params = ConnectParams::default();
    let mut ws = match tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        params = parse_params(req.uri().query());
        Ok(resp)
    })
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            if config::debug_enabled() {
                eprintln!("[ws] Upgrade failed: {e}");
            }
            return;
        }
    };

    if !params.acceptable() {
        // Unsupported version or encoding: drop the socket with no further
        // interaction.
        return;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(16);
    let handle = SessionHandle::new(params.client_id, out_tx);
    let session_id = handle.id;
    if events.send(DaemonEvent::Connection(handle)).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Value>(&text) {
                        Ok(payload) => {
                            if events
                                .send(DaemonEvent::Message { session_id, payload })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => eprintln!("[ws] Dropping malformed message: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // binary and ping/pong frames are ignored
                Some(Err(e)) => {
                    if config::debug_enabled() {
                        eprintln!("[ws] Connection error: {e}");
                    }
                    break;
                }
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(Outbound::Message(value)) => {
                    // Send on a no-longer-open socket is a no-op; the read
                    // side observes the closure and tears down.
                    if ws.send(Message::Text(value.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = ws
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            }
        }
    }

    let _ = events
        .send(DaemonEvent::SessionClosed { session_id })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;
    use tokio_tungstenite::{client_async, WebSocketStream};

    async fn connect(
        query: &str,
    ) -> (
        WebSocketStream<tokio::io::DuplexStream>,
        Receiver<DaemonEvent>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_connection(server, tx));
        let url = format!("ws://localhost/{query}");
        let (ws, _response) = client_async(&url, client).await.unwrap();
        (ws, rx)
    }

    // ── parameter parsing ─────────────────────────────────────────────────────

    #[test]
    fn parse_params_reads_all_three_keys() {
        let params = parse_params(Some("v=1&encoding=json&client_id=123"));
        assert_eq!(
            params,
            ConnectParams {
                v: "1".to_string(),
                encoding: "json".to_string(),
                client_id: "123".to_string(),
            }
        );
    }

    #[test]
    fn parse_params_tolerates_missing_query() {
        assert_eq!(parse_params(None), ConnectParams::default());
    }

    #[test]
    fn only_v1_json_is_acceptable() {
        assert!(parse_params(Some("v=1&encoding=json")).acceptable());
        assert!(!parse_params(Some("v=2&encoding=json")).acceptable());
        assert!(!parse_params(Some("v=1&encoding=etf")).acceptable());
        assert!(!parse_params(Some("encoding=json")).acceptable());
        assert!(!parse_params(Some("v=1")).acceptable());
    }

    #[test]
    fn empty_client_id_is_acceptable() {
        let params = parse_params(Some("v=1&encoding=json&client_id="));
        assert!(params.acceptable());
        assert!(params.client_id.is_empty());
    }

    // ── connection lifecycle ──────────────────────────────────────────────────

    #[tokio::test]
    async fn accepted_upgrade_emits_connection_with_client_id() {
        let (_ws, mut rx) = connect("?v=1&encoding=json&client_id=123").await;
        match rx.recv().await.unwrap() {
            DaemonEvent::Connection(handle) => assert_eq!(handle.client_id, "123"),
            _ => panic!("expected Connection event"),
        }
    }

    #[tokio::test]
    async fn missing_client_id_connects_with_empty_id() {
        let (_ws, mut rx) = connect("?v=1&encoding=json").await;
        match rx.recv().await.unwrap() {
            DaemonEvent::Connection(handle) => assert!(handle.client_id.is_empty()),
            _ => panic!("expected Connection event"),
        }
    }

    #[tokio::test]
    async fn unsupported_version_is_dropped_without_connection() {
        let (mut ws, mut rx) = connect("?v=2&encoding=json&client_id=123").await;
        assert!(rx.recv().await.is_none());
        // The server hung up right after the upgrade.
        assert!(matches!(ws.next().await, None | Some(Err(_))));
    }

    #[tokio::test]
    async fn unsupported_encoding_is_dropped_without_connection() {
        let (_ws, mut rx) = connect("?v=1&encoding=etf&client_id=123").await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn text_messages_are_parsed_and_relayed() {
        let (mut ws, mut rx) = connect("?v=1&encoding=json&client_id=123").await;
        let _handle = match rx.recv().await.unwrap() {
            DaemonEvent::Connection(handle) => handle,
            _ => panic!("expected Connection event"),
        };

        ws.send(Message::Text(json!({"cmd": "SET_ACTIVITY"}).to_string()))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            DaemonEvent::Message { payload, .. } => assert_eq!(payload["cmd"], "SET_ACTIVITY"),
            _ => panic!("expected Message event"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_and_connection_survives() {
        let (mut ws, mut rx) = connect("?v=1&encoding=json&client_id=123").await;
        let _handle = match rx.recv().await.unwrap() {
            DaemonEvent::Connection(handle) => handle,
            _ => panic!("expected Connection event"),
        };

        ws.send(Message::Text("not json".to_string())).await.unwrap();
        ws.send(Message::Text(json!({"cmd": "later"}).to_string()))
            .await
            .unwrap();

        // Only the well-formed message arrives.
        match rx.recv().await.unwrap() {
            DaemonEvent::Message { payload, .. } => assert_eq!(payload["cmd"], "later"),
            _ => panic!("expected Message event"),
        }
    }

    #[tokio::test]
    async fn outbound_messages_reach_the_client_as_text() {
        let (mut ws, mut rx) = connect("?v=1&encoding=json&client_id=123").await;
        let handle = match rx.recv().await.unwrap() {
            DaemonEvent::Connection(handle) => handle,
            _ => panic!("expected Connection event"),
        };

        handle.send(json!({"cmd": "SET_ACTIVITY", "args": {"pid": 42}}));
        match ws.next().await.unwrap().unwrap() {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["args"]["pid"], 42);
            }
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn client_close_yields_one_session_closed_event() {
        let (mut ws, mut rx) = connect("?v=1&encoding=json&client_id=123").await;
        let session_id = match rx.recv().await.unwrap() {
            DaemonEvent::Connection(handle) => handle.id,
            _ => panic!("expected Connection event"),
        };

        ws.close(None).await.unwrap();
        match rx.recv().await.unwrap() {
            DaemonEvent::SessionClosed { session_id: id } => assert_eq!(id, session_id),
            _ => panic!("expected SessionClosed event"),
        }
        assert!(rx.recv().await.is_none());
    }
}
