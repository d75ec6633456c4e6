use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use crate::config;
use crate::engine::{ActivityEvent, DetectedGame};
use crate::event::DaemonEvent;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Default close code for an orderly shutdown.
pub const CLOSE_CODE_NORMAL: u16 = 1000;
/// Handshake carried an empty client id (native transport only).
pub const CLOSE_CODE_INVALID_CLIENT_ID: u16 = 4000;
/// Handshake carried an unsupported protocol version.
pub const CLOSE_CODE_INVALID_VERSION: u16 = 4004;

/// Messages queued toward one connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Message(Value),
    Close { code: u16, reason: String },
}

/// One connected transport client, addressable by its `client_id`. Both the
/// native and the WebSocket transport hand the dispatch loop this same handle,
/// so activity routing never cares which protocol is underneath.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: u64,
    pub client_id: String,
    tx: mpsc::Sender<Outbound>,
}

impl SessionHandle {
    pub fn new(client_id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            client_id,
            tx,
        }
    }

    /// Queues a JSON message; a full or closed connection drops it.
    pub fn send(&self, message: Value) {
        let _ = self.tx.try_send(Outbound::Message(message));
    }

    /// Queues an orderly close.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// Sessions currently connected, owned exclusively by the dispatch loop.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<u64, SessionHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: SessionHandle) {
        self.sessions.insert(handle.id, handle);
    }

    pub fn remove(&mut self, session_id: u64) -> Option<SessionHandle> {
        self.sessions.remove(&session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Queues an orderly shutdown close toward every connected session.
    pub fn close_all(&self) {
        for session in self.sessions.values() {
            session.close(CLOSE_CODE_NORMAL, "shutting down");
        }
    }

    /// Waits until every connection task has torn down (observed as
    /// `SessionClosed` on the event channel), so queued close frames reach
    /// the wire before the process exits. Sessions still open at `timeout`
    /// are abandoned.
    pub async fn drain(&mut self, events: &mut mpsc::Receiver<DaemonEvent>, timeout: Duration) {
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        while !self.sessions.is_empty() {
            tokio::select! {
                _ = &mut deadline => break,
                evt = events.recv() => match evt {
                    Some(DaemonEvent::SessionClosed { session_id }) => {
                        self.remove(session_id);
                    }
                    Some(_) => {} // late activity is irrelevant during shutdown
                    None => break,
                }
            }
        }
    }

    /// Routes an activity transition to every session whose client id equals
    /// the game id. No matching session is a silent no-op.
    pub fn dispatch(&self, event: &ActivityEvent) {
        let (client_id, message) = match event {
            ActivityEvent::Set(game) => (&game.id, set_activity_message(game)),
            ActivityEvent::Clear { game_id, pid } => (game_id, clear_activity_message(*pid)),
        };

        let mut routed = 0;
        for session in self.sessions.values() {
            if session.client_id == *client_id {
                session.send(message.clone());
                routed += 1;
            }
        }
        if routed == 0 && config::debug_enabled() {
            eprintln!("[session] No session for client {client_id}; activity dropped");
        }
    }
}

/// Handler message for a detected game, addressed to the session whose client
/// id matches `game.id`.
pub fn set_activity_message(game: &DetectedGame) -> Value {
    json!({
        "cmd": "SET_ACTIVITY",
        "args": {
            "activity": {
                "application_id": game.id,
                "name": game.name,
                "timestamps": { "start": game.timestamp },
            },
            "pid": game.pid,
        },
    })
}

/// Handler message clearing activity after the game's process disappeared.
/// Carries the last known pid for closing-state bookkeeping.
pub fn clear_activity_message(pid: u32) -> Value {
    json!({
        "cmd": "SET_ACTIVITY",
        "args": {
            "activity": null,
            "pid": pid,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(client_id: &str) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(8);
        (SessionHandle::new(client_id.to_string(), tx), rx)
    }

    fn detected(id: &str, pid: u32, timestamp: i64) -> DetectedGame {
        DetectedGame {
            id: id.to_string(),
            name: "Example Game".to_string(),
            pid,
            timestamp,
        }
    }

    // ── message shapes ────────────────────────────────────────────────────────

    #[test]
    fn set_activity_message_shape() {
        let msg = set_activity_message(&detected("123", 42, 1700000000000));
        assert_eq!(msg["cmd"], "SET_ACTIVITY");
        assert_eq!(msg["args"]["activity"]["application_id"], "123");
        assert_eq!(msg["args"]["activity"]["name"], "Example Game");
        assert_eq!(msg["args"]["activity"]["timestamps"]["start"], 1700000000000i64);
        assert_eq!(msg["args"]["pid"], 42);
    }

    #[test]
    fn clear_activity_message_shape() {
        let msg = clear_activity_message(42);
        assert_eq!(msg["cmd"], "SET_ACTIVITY");
        assert!(msg["args"]["activity"].is_null());
        assert_eq!(msg["args"]["pid"], 42);
    }

    // ── registry routing ──────────────────────────────────────────────────────

    #[test]
    fn dispatch_routes_to_matching_client_only() {
        let (matching, mut matching_rx) = handle("123");
        let (other, mut other_rx) = handle("456");

        let mut registry = SessionRegistry::new();
        registry.insert(matching);
        registry.insert(other);

        registry.dispatch(&ActivityEvent::Set(detected("123", 42, 0)));

        assert!(matches!(matching_rx.try_recv(), Ok(Outbound::Message(_))));
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_without_matching_session_is_a_no_op() {
        let registry = SessionRegistry::new();
        // Must not panic or error.
        registry.dispatch(&ActivityEvent::Clear {
            game_id: "123".to_string(),
            pid: 42,
        });
    }

    #[test]
    fn remove_returns_the_session() {
        let (h, _rx) = handle("123");
        let id = h.id;
        let mut registry = SessionRegistry::new();
        registry.insert(h);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(id).is_some());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn session_ids_are_unique() {
        let (a, _ra) = handle("1");
        let (b, _rb) = handle("1");
        assert_ne!(a.id, b.id);
    }

    // ── shutdown drain ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn drain_waits_for_sessions_to_tear_down() {
        let (h, mut out_rx) = handle("123");
        let session_id = h.id;
        let (event_tx, mut event_rx) = mpsc::channel(8);

        // Stand-in for a connection task: flush the close, then tear down.
        tokio::spawn(async move {
            if let Some(Outbound::Close { .. }) = out_rx.recv().await {
                let _ = event_tx
                    .send(DaemonEvent::SessionClosed { session_id })
                    .await;
            }
        });

        let mut registry = SessionRegistry::new();
        registry.insert(h);
        registry.close_all();
        registry.drain(&mut event_rx, Duration::from_secs(1)).await;
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn drain_gives_up_at_the_deadline() {
        let (h, _out_rx) = handle("123");
        let (_event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(8);

        let mut registry = SessionRegistry::new();
        registry.insert(h);
        registry.close_all();
        // Nothing ever acknowledges; the deadline bounds the wait.
        registry.drain(&mut event_rx, Duration::from_millis(20)).await;
        assert_eq!(registry.len(), 1);
    }
}
