use serde_json::Value;

use crate::db::Game;
use crate::engine::ActivityEvent;
use crate::session::SessionHandle;

/// Events flowing into the central dispatch loop in `main`, from both
/// transports and the detection engine. Transports never touch engine state
/// and the engine never touches sessions; this channel is the only bridge.
pub enum DaemonEvent {
    /// A transport session completed its handshake (native) or upgrade (WebSocket).
    Connection(SessionHandle),
    /// A connected session delivered a parsed JSON payload.
    Message { session_id: u64, payload: Value },
    /// A session tore down; emitted exactly once per connected session.
    SessionClosed { session_id: u64 },
    /// The scan diff produced an activity transition.
    Activity(ActivityEvent),
    /// Ctrl+C received; the daemon should exit.
    Shutdown,
}

/// Commands consumed by the detection engine's scan task.
pub enum EngineCommand {
    /// Replace the games database; the index is rebuilt wholesale.
    ReplaceDatabase(Vec<Game>),
}
