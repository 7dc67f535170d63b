//! Arena State Definitions
//!
//! The replicated state of one room: an insertion-ordered map of
//! connection id to player.

use std::fmt;
use serde::{Serialize, Deserialize};

use crate::core::hash::{StateHash, StateHasher};
use crate::core::vec2::Vec2;

// =============================================================================
// CONNECTION ID
// =============================================================================

/// Identifier of one client connection (and of the player it owns).
///
/// Stable for the lifetime of the player, including across a reconnect.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Borrow the identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(8).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// PLAYER STATE
// =============================================================================

/// State of a single player in the arena.
#[derive(Clone, Debug, PartialEq)]
pub struct PlayerState {
    /// Owning connection
    pub id: ConnectionId,

    /// Sanitized display name
    pub name: String,

    /// Committee affiliation (cosmetic)
    pub committee: String,

    /// Position on the plane, always inside the arena bounds
    pub position: Vec2,

    /// Remaining health; zero means dead
    pub hp: i32,

    /// True while the punch animation window is open
    pub attacking: bool,

    /// 24-bit RGB display color
    pub color: u32,
}

impl PlayerState {
    /// Create a new player at a spawn position.
    pub fn new(
        id: ConnectionId,
        name: String,
        committee: String,
        color: u32,
        position: Vec2,
        hp: i32,
    ) -> Self {
        Self {
            id,
            name,
            committee,
            position,
            hp,
            attacking: false,
            color,
        }
    }

    /// Is player still alive?
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.hp > 0
    }

    /// Apply damage, never dropping below zero.
    /// Returns true if this hit killed the player.
    pub fn take_damage(&mut self, amount: i32) -> bool {
        let was_alive = self.is_alive();
        self.hp = (self.hp - amount).max(0);
        was_alive && !self.is_alive()
    }

    /// Hash this player's replicated fields.
    pub fn hash_into(&self, hasher: &mut StateHasher) {
        hasher.update_str(self.id.as_str());
        hasher.update_str(&self.name);
        hasher.update_str(&self.committee);
        hasher.update_vec2(self.position);
        hasher.update_i32(self.hp);
        hasher.update_bool(self.attacking);
        hasher.update_u32(self.color);
    }
}

// =============================================================================
// ARENA STATE
// =============================================================================

/// Root replicated object of a room.
///
/// Players are kept in insertion order; that order drives reset spawn
/// indices and hit-detection order.
#[derive(Clone, Debug, Default)]
pub struct ArenaState {
    players: Vec<PlayerState>,
}

impl ArenaState {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of players (connected or inside a reconnection window).
    #[inline]
    pub fn len(&self) -> usize {
        self.players.len()
    }

    /// True when nobody is in the arena.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Check if a player exists.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.players.iter().any(|p| &p.id == id)
    }

    /// Get player by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<&PlayerState> {
        self.players.iter().find(|p| &p.id == id)
    }

    /// Get mutable player by ID.
    pub fn get_mut(&mut self, id: &ConnectionId) -> Option<&mut PlayerState> {
        self.players.iter_mut().find(|p| &p.id == id)
    }

    /// Insert a player at the end of the map.
    /// An existing entry with the same ID is replaced in place.
    pub fn insert(&mut self, player: PlayerState) {
        match self.players.iter_mut().find(|p| p.id == player.id) {
            Some(existing) => *existing = player,
            None => self.players.push(player),
        }
    }

    /// Remove a player, preserving the order of the others.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<PlayerState> {
        let index = self.players.iter().position(|p| &p.id == id)?;
        Some(self.players.remove(index))
    }

    /// Iterate players in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.iter()
    }

    /// Iterate players mutably in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PlayerState> {
        self.players.iter_mut()
    }

    /// Player IDs in insertion order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.players.iter().map(|p| p.id.clone()).collect()
    }

    /// Get count of alive players.
    pub fn alive_count(&self) -> usize {
        self.players.iter().filter(|p| p.is_alive()).count()
    }

    /// Get the only alive player, if exactly one remains.
    pub fn sole_survivor(&self) -> Option<&PlayerState> {
        let mut alive = self.players.iter().filter(|p| p.is_alive());
        match (alive.next(), alive.next()) {
            (Some(player), None) => Some(player),
            _ => None,
        }
    }

    /// Check whether any player currently displays `color`.
    pub fn color_in_use(&self, color: u32) -> bool {
        self.players.iter().any(|p| p.color == color)
    }

    /// Compute hash of the replicated state.
    pub fn compute_hash(&self) -> StateHash {
        let mut hasher = StateHasher::for_arena_state();
        hasher.update_u32(self.players.len() as u32);
        for player in &self.players {
            player.hash_into(&mut hasher);
        }
        hasher.finalize()
    }
}
