use anyhow::{bail, Result};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::config;
use crate::event::DaemonEvent;
use crate::session::{
    Outbound, SessionHandle, CLOSE_CODE_INVALID_CLIENT_ID, CLOSE_CODE_INVALID_VERSION,
};

/// Only protocol version accepted at handshake.
pub const PROTOCOL_VERSION: i64 = 1;
/// Hard cap on a single frame payload; larger declarations are violations.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;
/// Number of indexed socket paths probed before giving up.
pub const MAX_SOCKET_PROBES: usize = 10;
/// Socket path stem; existing protocol clients look for these exact names.
pub const SOCKET_PREFIX: &str = "discord-ipc-";

const HEADER_BYTES: usize = 8;

/// Wire frame types. Values are fixed by the existing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Handshake = 0,
    Frame = 1,
    Close = 2,
    Ping = 3,
    Pong = 4,
}

impl FrameKind {
    fn from_wire(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Handshake),
            1 => Some(Self::Frame),
            2 => Some(Self::Close),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One decoded frame: type plus raw payload bytes. Payload JSON is parsed by
/// the connection state machine, which decides whether a parse failure is a
/// violation (handshake) or a droppable message (active traffic).
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl RawFrame {
    /// Builds a frame from a JSON value. Serializing a `Value` cannot fail.
    pub fn json(kind: FrameKind, value: &Value) -> Self {
        Self {
            kind,
            payload: serde_json::to_vec(value).unwrap_or_default(),
        }
    }
}

/// Codec for the length-prefixed binary framing:
/// `i32 LE type | i32 LE payload length | UTF-8 JSON payload`.
///
/// Decoding consumes nothing until a complete frame is buffered, so partial
/// delivery at any byte boundary is handled without data loss.
pub struct IpcCodec;

impl Decoder for IpcCodec {
    type Item = RawFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<RawFrame>> {
        if src.len() < HEADER_BYTES {
            return Ok(None);
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&src[0..4]);
        let kind_raw = i32::from_le_bytes(word);
        word.copy_from_slice(&src[4..8]);
        let declared_len = i32::from_le_bytes(word);

        if declared_len < 0 || declared_len as usize > MAX_PAYLOAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("declared payload of {declared_len} bytes exceeds the frame cap"),
            ));
        }
        let payload_len = declared_len as usize;
        if src.len() < HEADER_BYTES + payload_len {
            src.reserve(HEADER_BYTES + payload_len - src.len());
            return Ok(None);
        }

        let Some(kind) = FrameKind::from_wire(kind_raw) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type {kind_raw}"),
            ));
        };

        src.advance(HEADER_BYTES);
        let payload = src.split_to(payload_len).to_vec();
        Ok(Some(RawFrame { kind, payload }))
    }
}

impl Encoder<RawFrame> for IpcCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: RawFrame, dst: &mut BytesMut) -> io::Result<()> {
        if frame.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "outbound payload exceeds the frame cap",
            ));
        }
        dst.reserve(HEADER_BYTES + frame.payload.len());
        dst.put_i32_le(frame.kind as i32);
        dst.put_i32_le(frame.payload.len() as i32);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct Handshake {
    v: i64,
    #[serde(default)]
    client_id: String,
}

async fn write_close<S>(framed: &mut Framed<S, IpcCodec>, code: u16, message: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(RawFrame::json(
            FrameKind::Close,
            &serde_json::json!({ "code": code, "message": message }),
        ))
        .await
}

/// Runs one native connection to completion.
///
/// States: awaiting handshake (session is `None`) → active (session set) →
/// closed. Emits `Connection` once on a valid handshake and `SessionClosed`
/// exactly once afterwards, however the connection ends. Protocol violations
/// terminate the connection; a malformed JSON body inside an active FRAME is
/// merely dropped.
pub async fn run_connection<S>(stream: S, events: mpsc::Sender<DaemonEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, IpcCodec);
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(16);
    let mut session: Option<SessionHandle> = None;

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let frame = match incoming {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        if config::debug_enabled() {
                            eprintln!("[ipc] Protocol violation: {e}");
                        }
                        break;
                    }
                    None => break,
                };

                match frame.kind {
                    FrameKind::Handshake => {
                        if session.is_some() {
                            // At-most-once handshake; repeats are ignored.
                            continue;
                        }
                        let handshake: Handshake = match serde_json::from_slice(&frame.payload) {
                            Ok(h) => h,
                            Err(e) => {
                                if config::debug_enabled() {
                                    eprintln!("[ipc] Malformed handshake: {e}");
                                }
                                break;
                            }
                        };
                        if handshake.v != PROTOCOL_VERSION {
                            let _ = write_close(
                                &mut framed,
                                CLOSE_CODE_INVALID_VERSION,
                                "invalid version",
                            )
                            .await;
                            break;
                        }
                        if handshake.client_id.is_empty() {
                            let _ = write_close(
                                &mut framed,
                                CLOSE_CODE_INVALID_CLIENT_ID,
                                "invalid client id",
                            )
                            .await;
                            break;
                        }
                        let handle = SessionHandle::new(handshake.client_id, out_tx.clone());
                        if events
                            .send(DaemonEvent::Connection(handle.clone()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                        session = Some(handle);
                    }
                    FrameKind::Frame => {
                        let Some(active) = &session else {
                            break; // only a handshake is meaningful here
                        };
                        match serde_json::from_slice::<Value>(&frame.payload) {
                            Ok(payload) => {
                                if events
                                    .send(DaemonEvent::Message {
                                        session_id: active.id,
                                        payload,
                                    })
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => eprintln!("[ipc] Dropping malformed message: {e}"),
                        }
                    }
                    FrameKind::Ping => {
                        if session.is_none() {
                            break;
                        }
                        let pong = RawFrame {
                            kind: FrameKind::Pong,
                            payload: frame.payload,
                        };
                        if framed.send(pong).await.is_err() {
                            break;
                        }
                    }
                    FrameKind::Pong => {
                        if session.is_none() {
                            break;
                        }
                    }
                    FrameKind::Close => break,
                }
            }
            outgoing = out_rx.recv() => match outgoing {
                Some(Outbound::Message(value)) => {
                    if framed.send(RawFrame::json(FrameKind::Frame, &value)).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let _ = write_close(&mut framed, code, &reason).await;
                    break;
                }
                None => break,
            }
        }
    }

    if let Some(active) = session {
        let _ = events
            .send(DaemonEvent::SessionClosed {
                session_id: active.id,
            })
            .await;
    }
}

/// Native socket server bound to the first free indexed path.
#[cfg(unix)]
pub struct IpcServer {
    listener: tokio::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl IpcServer {
    /// Probes `discord-ipc-0` through `discord-ipc-9`, connecting to each to
    /// test liveness; a path that refuses the connection or does not exist is
    /// free (any stale filesystem artifact is removed first). Exhausting the
    /// probe budget is a fatal startup error.
    pub async fn bind() -> Result<Self> {
        let dir = crate::paths::socket_dir();
        for i in 0..MAX_SOCKET_PROBES {
            let path = dir.join(format!("{SOCKET_PREFIX}{i}"));
            if tokio::net::UnixStream::connect(&path).await.is_ok() {
                continue; // a live server owns this slot
            }
            let _ = std::fs::remove_file(&path);
            match tokio::net::UnixListener::bind(&path) {
                Ok(listener) => {
                    println!("[ipc] Listening on {}", path.display());
                    return Ok(Self { listener, path });
                }
                Err(e) => {
                    if config::debug_enabled() {
                        eprintln!("[ipc] Could not bind {}: {e}", path.display());
                    }
                }
            }
        }
        bail!("no free IPC socket path after {MAX_SOCKET_PROBES} probes")
    }

    pub async fn serve(self, events: mpsc::Sender<DaemonEvent>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    tokio::spawn(run_connection(stream, events.clone()));
                }
                Err(e) => {
                    eprintln!("[ipc] Accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }
    }
}

#[cfg(unix)]
impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Named-pipe variant of the native server.
#[cfg(windows)]
pub struct IpcServer {
    first: tokio::net::windows::named_pipe::NamedPipeServer,
    path: String,
}

#[cfg(windows)]
impl IpcServer {
    pub async fn bind() -> Result<Self> {
        use tokio::net::windows::named_pipe::ServerOptions;

        for i in 0..MAX_SOCKET_PROBES {
            let path = format!(r"\\.\pipe\{SOCKET_PREFIX}{i}");
            // Claiming the first instance fails while another server owns
            // the pipe name, which doubles as the liveness probe.
            match ServerOptions::new().first_pipe_instance(true).create(&path) {
                Ok(first) => {
                    println!("[ipc] Listening on {path}");
                    return Ok(Self { first, path });
                }
                Err(e) => {
                    if config::debug_enabled() {
                        eprintln!("[ipc] Could not claim {path}: {e}");
                    }
                }
            }
        }
        bail!("no free IPC pipe name after {MAX_SOCKET_PROBES} probes")
    }

    pub async fn serve(self, events: mpsc::Sender<DaemonEvent>) {
        use tokio::net::windows::named_pipe::ServerOptions;

        let mut server = self.first;
        loop {
            if let Err(e) = server.connect().await {
                eprintln!("[ipc] Pipe accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
            let next = match ServerOptions::new().create(&self.path) {
                Ok(next) => next,
                Err(e) => {
                    eprintln!("[ipc] Could not create pipe instance: {e}");
                    break;
                }
            };
            let stream = std::mem::replace(&mut server, next);
            tokio::spawn(run_connection(stream, events.clone()));
        }
    }
}
