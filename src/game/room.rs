//! Authoritative Game Room
//!
//! The single owner of a room's [`ArenaState`]. Every lifecycle callback,
//! player message and timer firing goes through one `GameRoom` method and
//! is applied to completion before the next one starts.
//!
//! The room never sleeps or spawns anything itself. Deferred work (the
//! punch animation window, the reconnection grace window) is returned as
//! [`TimerRequest`]s in a [`RoomOutcome`]; whoever drives the room must
//! call [`GameRoom::on_timer`] with the same key and generation when the
//! delay elapses. A firing whose generation is no longer current is a
//! no-op, so a late timer can never touch a removed or replaced player.

use std::collections::HashMap;
use std::time::Duration;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::core::vec2::Vec2;
use crate::game::combat::punch_targets;
use crate::game::events::{DeathEvent, RoomEvent, WinnerEvent};
use crate::game::identity::{resolve_color, resolve_committee, sanitize_name};
use crate::game::spawn::spawn_position;
use crate::game::state::{ArenaState, ConnectionId, PlayerState};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Rules of a room.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum participants (enforced by the transport when routing joins).
    pub max_players: usize,
    /// Health every player starts (and resets) with.
    pub initial_hp: i32,
    /// Maximum attacker-target distance for a hit (exclusive).
    pub punch_radius: f64,
    /// Minimum time between two accepted attacks from one connection.
    pub attack_cooldown: Duration,
    /// How long the `attacking` flag stays raised.
    pub attack_duration: Duration,
    /// Grace window for a connection that dropped without leaving.
    pub reconnect_grace: Duration,
    /// Arena width.
    pub arena_width: f64,
    /// Arena height.
    pub arena_height: f64,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_players: 12,
            initial_hp: 3,
            punch_radius: 33.0,
            attack_cooldown: Duration::from_millis(500),
            attack_duration: Duration::from_millis(300),
            reconnect_grace: Duration::from_secs(60),
            arena_width: 800.0,
            arena_height: 600.0,
        }
    }
}

/// Options a client supplies when joining. All optional.
///
/// A field of the wrong JSON type reads as absent, so the join still
/// goes through with the defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinOptions {
    /// Requested display name.
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    /// Declared committee.
    #[serde(default, deserialize_with = "lenient")]
    pub committee: Option<String>,
    /// Requested 24-bit color.
    #[serde(default, deserialize_with = "lenient")]
    pub color: Option<u32>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

// =============================================================================
// TIMERS & OUTCOMES
// =============================================================================

/// Kinds of deferred transitions a room schedules per connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Lower the `attacking` flag after the punch animation.
    AttackReset,
    /// Remove a dropped player whose grace window ran out.
    ReconnectExpiry,
}

/// Key of a pending timer. At most one timer per key is live.
pub type TimerKey = (ConnectionId, TimerKind);

/// A request to call [`GameRoom::on_timer`] after `delay`.
///
/// Scheduling a key that already has a live timer replaces it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerRequest {
    /// Owning connection.
    pub connection: ConnectionId,
    /// What the timer does.
    pub kind: TimerKind,
    /// Token that must be echoed back when firing.
    pub generation: u64,
    /// Delay from now.
    pub delay: Duration,
}

impl TimerRequest {
    /// Key this request occupies.
    pub fn key(&self) -> TimerKey {
        (self.connection.clone(), self.kind)
    }
}

/// Everything a single room operation produced besides state mutation.
#[derive(Debug, Default, PartialEq)]
pub struct RoomOutcome {
    /// Events to broadcast, in order.
    pub events: Vec<RoomEvent>,
    /// Timers to start.
    pub schedule: Vec<TimerRequest>,
    /// Timers to abort.
    pub cancel: Vec<TimerKey>,
    /// Whether replicated state changed.
    pub state_changed: bool,
}

impl RoomOutcome {
    /// True when nothing needs to be published or scheduled.
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
            && self.schedule.is_empty()
            && self.cancel.is_empty()
            && !self.state_changed
    }
}

/// Why a reconnection attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// No player is held for this connection.
    #[error("no player waiting for reconnection")]
    NotAwaiting,
    /// The player's previous connection has not dropped yet.
    #[error("player is still connected")]
    StillConnected,
    /// The grace window already closed.
    #[error("reconnection window expired")]
    Expired,
}

// =============================================================================
// GAME ROOM
// =============================================================================

/// Authoritative state machine of one match.
pub struct GameRoom {
    /// Room rules.
    config: RoomConfig,
    /// Replicated state.
    state: ArenaState,
    /// Time of the last accepted attack per connection.
    last_attack: HashMap<ConnectionId, Instant>,
    /// Generation of the live timer per key.
    pending_timers: HashMap<TimerKey, u64>,
    /// Grace deadline of players that dropped without leaving.
    awaiting_reconnect: HashMap<ConnectionId, Instant>,
    /// Monotonic source of timer generations.
    next_generation: u64,
    /// One-shot flag, cleared only by reset.
    winner_announced: bool,
}

impl GameRoom {
    /// Create an empty room.
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            state: ArenaState::new(),
            last_attack: HashMap::new(),
            pending_timers: HashMap::new(),
            awaiting_reconnect: HashMap::new(),
            next_generation: 1,
            winner_announced: false,
        }
    }

    /// Replicated state.
    pub fn state(&self) -> &ArenaState {
        &self.state
    }

    /// Player count, including players inside a reconnection window.
    pub fn player_count(&self) -> usize {
        self.state.len()
    }

    /// Whether the room has reached its participant limit.
    pub fn is_full(&self) -> bool {
        self.state.len() >= self.config.max_players
    }

    /// Whether a winner was announced in the current epoch.
    pub fn winner_announced(&self) -> bool {
        self.winner_announced
    }

    /// Whether the player's connection dropped and may still resume.
    pub fn is_awaiting_reconnect(&self, id: &ConnectionId) -> bool {
        self.awaiting_reconnect.contains_key(id)
    }

    /// Whether a timer is live for `key`.
    pub fn has_pending_timer(&self, id: &ConnectionId, kind: TimerKind) -> bool {
        self.pending_timers.contains_key(&(id.clone(), kind))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Add a player for a new connection.
    pub fn join(&mut self, id: ConnectionId, options: &JoinOptions) -> RoomOutcome {
        let mut outcome = RoomOutcome::default();

        if self.state.contains(&id) {
            debug!("Join ignored, {} already in room", id.short());
            return outcome;
        }

        let name = sanitize_name(options.name.as_deref(), &id);
        let committee = resolve_committee(options.committee.as_deref());
        let color = resolve_color(options.color, &self.state);
        let position = spawn_position(self.state.len());

        let player = PlayerState::new(
            id.clone(),
            name,
            committee,
            color,
            position,
            self.config.initial_hp,
        );

        info!(
            "{} joined as {} at {} with color {:06x}",
            player.name, player.committee, player.position, player.color
        );

        self.state.insert(player);
        outcome.state_changed = true;
        info!("Players in room: {}", self.state.len());

        self.check_winner(&mut outcome);
        outcome
    }

    /// Handle a connection going away.
    ///
    /// A consented leave removes the player immediately. Otherwise the
    /// player is held untouched for the grace window and a
    /// [`TimerKind::ReconnectExpiry`] timer is requested.
    pub fn leave(&mut self, id: &ConnectionId, consented: bool, now: Instant) -> RoomOutcome {
        let mut outcome = RoomOutcome::default();

        let Some(player) = self.state.get(id) else {
            debug!("Leave from unknown connection {}", id.short());
            return outcome;
        };

        if consented {
            info!("{} left the game", player.name);
            self.remove_player(id, &mut outcome);
            return outcome;
        }

        if self.awaiting_reconnect.contains_key(id) {
            return outcome;
        }

        info!(
            "{} disconnected, holding for {}s",
            player.name,
            self.config.reconnect_grace.as_secs()
        );

        self.awaiting_reconnect
            .insert(id.clone(), now + self.config.reconnect_grace);
        let delay = self.config.reconnect_grace;
        self.schedule(id, TimerKind::ReconnectExpiry, delay, &mut outcome);
        outcome
    }

    /// Resume a dropped connection inside its grace window.
    ///
    /// On success the player keeps everything it had and the expiry timer
    /// is canceled.
    pub fn reconnect(
        &mut self,
        id: &ConnectionId,
        now: Instant,
    ) -> Result<RoomOutcome, ReconnectError> {
        let Some(deadline) = self.awaiting_reconnect.get(id).copied() else {
            return Err(if self.state.contains(id) {
                ReconnectError::StillConnected
            } else {
                ReconnectError::NotAwaiting
            });
        };

        if now > deadline {
            return Err(ReconnectError::Expired);
        }

        self.awaiting_reconnect.remove(id);

        let mut outcome = RoomOutcome::default();
        self.cancel(id, TimerKind::ReconnectExpiry, &mut outcome);

        if let Some(player) = self.state.get(id) {
            info!("{} reconnected", player.name);
        }
        Ok(outcome)
    }

    /// Restore every player to full health at a fresh spawn slot.
    ///
    /// Any connected client may request this.
    pub fn reset(&mut self, requested_by: &ConnectionId) -> RoomOutcome {
        let mut outcome = RoomOutcome::default();
        info!("Reset requested by {}", requested_by.short());

        let initial_hp = self.config.initial_hp;
        for (index, player) in self.state.iter_mut().enumerate() {
            player.hp = initial_hp;
            player.attacking = false;
            player.position = spawn_position(index);
        }

        for id in self.state.ids() {
            self.cancel(&id, TimerKind::AttackReset, &mut outcome);
        }

        self.winner_announced = false;
        outcome.state_changed = true;

        info!("All {} players reset", self.state.len());
        outcome
    }

    // =========================================================================
    // Player messages
    // =========================================================================

    /// Apply a client-computed displacement, clamped to the arena.
    pub fn handle_move(&mut self, id: &ConnectionId, dx: f64, dy: f64) -> RoomOutcome {
        let mut outcome = RoomOutcome::default();
        let delta = Vec2::new(dx, dy);

        let Some(player) = self.state.get_mut(id) else {
            debug!("Move from unknown player {}", id.short());
            return outcome;
        };

        if !player.is_alive() {
            return outcome;
        }

        if delta.is_zero() {
            return outcome;
        }

        if !delta.is_finite() {
            debug!("Non-finite move from {} ignored", id.short());
            return outcome;
        }

        player.position = (player.position + delta)
            .clamp_to(self.config.arena_width, self.config.arena_height);
        outcome.state_changed = true;
        outcome
    }

    /// Throw a punch.
    ///
    /// Every other living player inside the punch radius loses one point
    /// of health. Deaths are announced in arena order, each followed by a
    /// winner check.
    pub fn handle_attack(&mut self, id: &ConnectionId, now: Instant) -> RoomOutcome {
        let mut outcome = RoomOutcome::default();

        let attacker_name = match self.state.get(id) {
            Some(attacker) if attacker.is_alive() => attacker.name.clone(),
            Some(_) => return outcome,
            None => {
                debug!("Attack from unknown player {}", id.short());
                return outcome;
            }
        };

        if let Some(last) = self.last_attack.get(id) {
            if now.saturating_duration_since(*last) < self.config.attack_cooldown {
                debug!("Attack from {} on cooldown", id.short());
                return outcome;
            }
        }
        self.last_attack.insert(id.clone(), now);

        if let Some(attacker) = self.state.get_mut(id) {
            attacker.attacking = true;
            debug!("{} is attacking at {}", attacker.name, attacker.position);
        }
        outcome.state_changed = true;

        for target_id in punch_targets(&self.state, id, self.config.punch_radius) {
            let Some(target) = self.state.get_mut(&target_id) else {
                continue;
            };

            if !target.take_damage(1) {
                continue;
            }

            info!("{} was knocked out by {}", target.name, attacker_name);
            outcome.events.push(RoomEvent::Death(DeathEvent {
                id: target_id.clone(),
                committee: target.committee.clone(),
                killer_name: attacker_name.clone(),
            }));

            self.check_winner(&mut outcome);
        }

        let delay = self.config.attack_duration;
        self.schedule(id, TimerKind::AttackReset, delay, &mut outcome);
        outcome
    }

    /// Fire a previously requested timer.
    pub fn on_timer(&mut self, id: &ConnectionId, kind: TimerKind, generation: u64) -> RoomOutcome {
        let mut outcome = RoomOutcome::default();
        let key = (id.clone(), kind);

        if self.pending_timers.get(&key) != Some(&generation) {
            debug!("Stale {:?} timer for {} dropped", kind, id.short());
            return outcome;
        }
        self.pending_timers.remove(&key);

        match kind {
            TimerKind::AttackReset => {
                if let Some(player) = self.state.get_mut(id) {
                    if player.attacking {
                        player.attacking = false;
                        outcome.state_changed = true;
                    }
                }
            }
            TimerKind::ReconnectExpiry => {
                if self.awaiting_reconnect.contains_key(id) {
                    if let Some(player) = self.state.get(id) {
                        info!("{} did not reconnect in time", player.name);
                    }
                    self.remove_player(id, &mut outcome);
                }
            }
        }

        outcome
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Announce a winner if exactly one of several players survives.
    fn check_winner(&mut self, outcome: &mut RoomOutcome) {
        if self.winner_announced || self.state.len() <= 1 {
            return;
        }

        if let Some(winner) = self.state.sole_survivor() {
            info!("{} wins!", winner.name);
            outcome.events.push(RoomEvent::Winner(WinnerEvent::for_player(winner)));
            self.winner_announced = true;
        }
    }

    /// Drop a player and everything the room tracks for it.
    fn remove_player(&mut self, id: &ConnectionId, outcome: &mut RoomOutcome) {
        if let Some(player) = self.state.remove(id) {
            info!("Removed {} from game", player.name);
            outcome.state_changed = true;
        }

        self.last_attack.remove(id);
        self.awaiting_reconnect.remove(id);
        self.cancel(id, TimerKind::AttackReset, outcome);
        self.cancel(id, TimerKind::ReconnectExpiry, outcome);

        self.check_winner(outcome);
    }

    fn schedule(
        &mut self,
        id: &ConnectionId,
        kind: TimerKind,
        delay: Duration,
        outcome: &mut RoomOutcome,
    ) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.pending_timers.insert((id.clone(), kind), generation);
        outcome.schedule.push(TimerRequest {
            connection: id.clone(),
            kind,
            generation,
            delay,
        });
    }

    fn cancel(&mut self, id: &ConnectionId, kind: TimerKind, outcome: &mut RoomOutcome) {
        let key = (id.clone(), kind);
        if self.pending_timers.remove(&key).is_some() {
            outcome.cancel.push(key);
        }
    }
}
