//! Room Events
//!
//! Informational broadcasts produced while processing room commands.
//! Events never mutate state; they are announced in the order they occur.

use serde::{Serialize, Deserialize};

use crate::game::state::{ConnectionId, PlayerState};

/// A player was knocked out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathEvent {
    /// Player that died
    pub id: ConnectionId,
    /// Committee of the player that died
    pub committee: String,
    /// Display name of the attacker
    #[serde(rename = "killerName")]
    pub killer_name: String,
}

/// Exactly one player is left standing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinnerEvent {
    /// Surviving player
    pub id: ConnectionId,
    /// Display name of the survivor
    pub name: String,
    /// Committee of the survivor
    pub committee: String,
}

impl WinnerEvent {
    /// Build the announcement for a surviving player.
    pub fn for_player(player: &PlayerState) -> Self {
        Self {
            id: player.id.clone(),
            name: player.name.clone(),
            committee: player.committee.clone(),
        }
    }
}

/// Event broadcast to every client in the room.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomEvent {
    /// Player eliminated by a punch
    Death(DeathEvent),
    /// Winner announced
    Winner(WinnerEvent),
}

impl RoomEvent {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomEvent::Death(_) => "death",
            RoomEvent::Winner(_) => "winner",
        }
    }
}
