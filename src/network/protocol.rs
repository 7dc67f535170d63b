//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Messages are JSON objects tagged by a snake_case `type` field.

use serde::{Serialize, Deserialize};

use crate::game::events::{DeathEvent, RoomEvent, WinnerEvent};
use crate::game::room::JoinOptions;
use crate::game::state::{ArenaState, ConnectionId, PlayerState};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room with optional identity preferences.
    Join(JoinOptions),

    /// Resume a dropped connection.
    Reconnect {
        /// Token handed out in `welcome`.
        token: String,
    },

    /// Client-computed displacement.
    Move {
        /// Horizontal delta.
        dx: f64,
        /// Vertical delta.
        dy: f64,
    },

    /// Throw a punch.
    Attack,

    /// Restart the round for everyone.
    Reset,

    /// Leave the room for good.
    Leave,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Reconnect { .. } => "reconnect",
            ClientMessage::Move { .. } => "move",
            ClientMessage::Attack => "attack",
            ClientMessage::Reset => "reset",
            ClientMessage::Leave => "leave",
            ClientMessage::Ping { .. } => "ping",
        }
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Seat confirmation, sent before the first snapshot.
    Welcome(WelcomeInfo),

    /// Full room snapshot.
    State(StateSnapshot),

    /// A player was knocked out.
    Death(DeathEvent),

    /// One player is left standing.
    Winner(WinnerEvent),

    /// Pong response.
    Pong { timestamp: u64, server_time: u64 },

    /// Error message.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown { reason: String },
}

impl From<&RoomEvent> for ServerMessage {
    fn from(event: &RoomEvent) -> Self {
        match event {
            RoomEvent::Death(death) => ServerMessage::Death(death.clone()),
            RoomEvent::Winner(winner) => ServerMessage::Winner(winner.clone()),
        }
    }
}

/// Seat information for a joined or reconnected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WelcomeInfo {
    /// Id of the player this connection controls.
    pub connection_id: ConnectionId,
    /// Opaque token for `reconnect`.
    pub reconnection_token: String,
    /// Room the player is in.
    pub room_id: String,
}

/// Replicated view of one player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    /// Player identifier.
    pub id: ConnectionId,
    /// Display name.
    pub name: String,
    /// Committee label.
    pub committee: String,
    /// Horizontal position.
    pub x: f64,
    /// Vertical position.
    pub y: f64,
    /// Remaining health.
    pub hp: i32,
    /// Punch animation flag.
    pub attacking: bool,
    /// 24-bit RGB color.
    pub color: u32,
}

impl From<&PlayerState> for PlayerSnapshot {
    fn from(player: &PlayerState) -> Self {
        Self {
            id: player.id.clone(),
            name: player.name.clone(),
            committee: player.committee.clone(),
            x: player.position.x,
            y: player.position.y,
            hp: player.hp,
            attacking: player.attacking,
            color: player.color,
        }
    }
}

/// Full ordered room state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Players in insertion order.
    pub players: Vec<PlayerSnapshot>,
    /// Hex SHA-256 over the replicated fields.
    pub state_hash: String,
}

impl StateSnapshot {
    /// Capture the current arena.
    pub fn capture(arena: &ArenaState) -> Self {
        Self {
            players: arena.iter().map(PlayerSnapshot::from).collect(),
            state_hash: hex::encode(arena.compute_hash()),
        }
    }

    /// Find a player by id.
    pub fn player(&self, id: &ConnectionId) -> Option<&PlayerSnapshot> {
        self.players.iter().find(|p| &p.id == id)
    }
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    /// Build an error reply.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed.
    InvalidMessage,
    /// Gameplay message before join.
    NotJoined,
    /// Join or reconnect while already seated.
    AlreadyJoined,
    /// Reconnection token unknown or window closed.
    ReconnectFailed,
    /// Server overloaded.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

/// Milliseconds since the Unix epoch, for `pong`.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Deserialize from a binary frame holding UTF-8 JSON.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
