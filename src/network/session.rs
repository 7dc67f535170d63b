//! Room Sessions
//!
//! Runs each [`GameRoom`] inside its own task and routes connections to
//! rooms.
//!
//! A room task owns its room outright and drains a command queue one
//! message at a time, so every lifecycle callback, player message and
//! timer firing is applied to completion before the next begins. Timers
//! are sleeping tasks that post a [`RoomCommand::Timer`] back into the same
//! queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::game::room::{
    GameRoom, JoinOptions, ReconnectError, RoomConfig, RoomOutcome, TimerKey, TimerKind,
    TimerRequest,
};
use crate::game::state::ConnectionId;
use crate::network::protocol::{ServerMessage, StateSnapshot, WelcomeInfo};

/// Unique room identifier.
pub type RoomId = String;

/// Outbound message channel of one client.
pub type ClientSender = mpsc::Sender<ServerMessage>;

/// Capacity of a room's command queue.
const COMMAND_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// COMMANDS
// =============================================================================

/// Everything a room task can be asked to do.
#[derive(Debug)]
pub enum RoomCommand {
    /// Seat a new connection.
    Join {
        connection: ConnectionId,
        options: JoinOptions,
        token: String,
        sender: ClientSender,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Resume a dropped connection.
    Reconnect {
        connection: ConnectionId,
        token: String,
        sender: ClientSender,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Player displacement.
    Move { connection: ConnectionId, dx: f64, dy: f64 },

    /// Player punch.
    Attack { connection: ConnectionId },

    /// Round restart.
    Reset { connection: ConnectionId },

    /// Connection went away.
    Leave { connection: ConnectionId, consented: bool },

    /// A scheduled timer elapsed.
    Timer { connection: ConnectionId, kind: TimerKind, generation: u64 },

    /// Stop the room.
    Shutdown,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Room task is gone.
    #[error("Room closed")]
    RoomClosed,

    /// Room reached its participant limit.
    #[error("Room is full")]
    RoomFull,

    /// Token does not map to any seat.
    #[error("Unknown reconnection token")]
    UnknownReconnectToken,

    /// Room refused the reconnection.
    #[error("Reconnect failed: {0}")]
    ReconnectFailed(#[from] ReconnectError),
}

// =============================================================================
// ROOM HANDLE
// =============================================================================

/// Cloneable reference to a running room task.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    /// Room identifier.
    id: RoomId,
    /// Command queue.
    commands: mpsc::Sender<RoomCommand>,
    /// Player count as of the last processed command.
    occupancy: Arc<AtomicUsize>,
    /// Set once the task has exited.
    closed: Arc<AtomicBool>,
}

impl RoomHandle {
    /// Room identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Players currently in the room, including held ones.
    pub fn player_count(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    /// Whether the room task has exited.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.commands.is_closed()
    }

    /// Queue a command.
    pub async fn send(&self, command: RoomCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::RoomClosed)
    }
}

/// Start a room task.
pub fn spawn_room(config: RoomConfig) -> RoomHandle {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let (commands, queue) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let occupancy = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    let task = RoomTask {
        id: id.clone(),
        room: GameRoom::new(config),
        clients: BTreeMap::new(),
        timers: HashMap::new(),
        loopback: commands.downgrade(),
        occupancy: occupancy.clone(),
    };

    let task_closed = closed.clone();
    tokio::spawn(async move {
        task.run(queue).await;
        task_closed.store(true, Ordering::Release);
    });

    RoomHandle {
        id,
        commands,
        occupancy,
        closed,
    }
}

// =============================================================================
// ROOM TASK
// =============================================================================

/// State owned by a running room.
struct RoomTask {
    id: RoomId,
    room: GameRoom,
    /// Outbound channels of connected clients.
    clients: BTreeMap<ConnectionId, ClientSender>,
    /// Live timers with their generation.
    timers: HashMap<TimerKey, (u64, AbortHandle)>,
    /// Weak so pending timers don't keep the room alive.
    loopback: mpsc::WeakSender<RoomCommand>,
    occupancy: Arc<AtomicUsize>,
}

impl RoomTask {
    async fn run(mut self, mut queue: mpsc::Receiver<RoomCommand>) {
        info!("Room {} opened", self.short_id());

        while let Some(command) = queue.recv().await {
            if !self.handle(command) {
                break;
            }
            self.occupancy.store(self.room.player_count(), Ordering::Release);
        }

        queue.close();
        for (_, (_, handle)) in self.timers.drain() {
            handle.abort();
        }
        self.occupancy.store(0, Ordering::Release);
        info!("Room {} closed", self.short_id());
    }

    /// Apply one command. Returns false when the room should stop.
    fn handle(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join { connection, options, token, sender, reply } => {
                if self.room.is_full() {
                    let _ = reply.send(Err(SessionError::RoomFull));
                    return true;
                }

                self.welcome(&connection, token, &sender);
                self.clients.insert(connection.clone(), sender);
                let outcome = self.room.join(connection, &options);
                self.apply(outcome);
                self.occupancy.store(self.room.player_count(), Ordering::Release);
                let _ = reply.send(Ok(()));
            }

            RoomCommand::Reconnect { connection, token, sender, reply } => {
                match self.room.reconnect(&connection, Instant::now()) {
                    Ok(outcome) => {
                        self.welcome(&connection, token, &sender);
                        self.clients.insert(connection.clone(), sender);
                        self.apply(outcome);
                        self.send_snapshot(&connection);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        debug!("Reconnect of {} refused: {}", connection.short(), e);
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }

            RoomCommand::Move { connection, dx, dy } => {
                let outcome = self.room.handle_move(&connection, dx, dy);
                self.apply(outcome);
            }

            RoomCommand::Attack { connection } => {
                let outcome = self.room.handle_attack(&connection, Instant::now());
                self.apply(outcome);
            }

            RoomCommand::Reset { connection } => {
                let outcome = self.room.reset(&connection);
                self.apply(outcome);
            }

            RoomCommand::Leave { connection, consented } => {
                self.clients.remove(&connection);
                let outcome = self.room.leave(&connection, consented, Instant::now());
                self.apply(outcome);
                return !self.room.state().is_empty();
            }

            RoomCommand::Timer { connection, kind, generation } => {
                let key = (connection.clone(), kind);
                if matches!(self.timers.get(&key), Some((live, _)) if *live == generation) {
                    self.timers.remove(&key);
                }
                debug!("{:?} timer fired for {}", kind, connection.short());
                let outcome = self.room.on_timer(&connection, kind, generation);
                self.apply(outcome);
                return !self.room.state().is_empty();
            }

            RoomCommand::Shutdown => {
                info!("Room {} shutting down", self.short_id());
                return false;
            }
        }

        true
    }

    /// Publish an outcome: timers first, then events, then one snapshot.
    fn apply(&mut self, outcome: RoomOutcome) {
        for key in outcome.cancel {
            if let Some((_, handle)) = self.timers.remove(&key) {
                handle.abort();
            }
        }

        for request in outcome.schedule {
            self.start_timer(request);
        }

        for event in &outcome.events {
            debug!("Broadcasting {} in room {}", event.kind(), self.short_id());
            self.broadcast(ServerMessage::from(event));
        }

        if outcome.state_changed {
            self.broadcast(ServerMessage::State(StateSnapshot::capture(self.room.state())));
        }
    }

    fn start_timer(&mut self, request: TimerRequest) {
        let key = request.key();
        if let Some((_, previous)) = self.timers.remove(&key) {
            previous.abort();
        }

        let loopback = self.loopback.clone();
        let TimerRequest { connection, kind, generation, delay } = request;

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = loopback.upgrade() {
                let _ = commands
                    .send(RoomCommand::Timer { connection, kind, generation })
                    .await;
            }
        });

        self.timers.insert(key, (generation, task.abort_handle()));
    }

    fn welcome(&self, connection: &ConnectionId, token: String, sender: &ClientSender) {
        let welcome = ServerMessage::Welcome(WelcomeInfo {
            connection_id: connection.clone(),
            reconnection_token: token,
            room_id: self.id.clone(),
        });
        deliver(connection, sender, welcome);
    }

    fn send_snapshot(&self, connection: &ConnectionId) {
        if let Some(sender) = self.clients.get(connection) {
            let snapshot = ServerMessage::State(StateSnapshot::capture(self.room.state()));
            deliver(connection, sender, snapshot);
        }
    }

    /// Send a message to every connected client in the room.
    fn broadcast(&self, message: ServerMessage) {
        for (connection, sender) in &self.clients {
            deliver(connection, sender, message.clone());
        }
    }

    fn short_id(&self) -> &str {
        &self.id[..8.min(self.id.len())]
    }
}

/// Queue a message without blocking the room on a slow client.
fn deliver(connection: &ConnectionId, sender: &ClientSender, message: ServerMessage) {
    match sender.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Outbound queue full for {}, dropping message", connection.short());
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!("Outbound queue closed for {}", connection.short());
        }
    }
}

// =============================================================================
// ROOM REGISTRY
// =============================================================================

/// A connection's place in a room.
#[derive(Debug, Clone)]
pub struct Seat {
    /// Room holding the player.
    pub room: RoomHandle,
    /// Player id.
    pub connection: ConnectionId,
    /// Reconnection token.
    pub token: String,
}

impl Seat {
    /// Forward a command to the seat's room.
    pub async fn send(&self, command: RoomCommand) -> Result<(), SessionError> {
        self.room.send(command).await
    }
}

/// Routes connections to rooms.
pub struct RoomRegistry {
    /// Rules for new rooms.
    config: RoomConfig,
    /// Open rooms.
    rooms: RwLock<BTreeMap<RoomId, RoomHandle>>,
    /// Reconnection token to (room, player).
    tokens: RwLock<BTreeMap<String, (RoomId, ConnectionId)>>,
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new(config: RoomConfig) -> Self {
        Self {
            config,
            rooms: RwLock::new(BTreeMap::new()),
            tokens: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seat a new connection in the first room with space, opening a new
    /// room when all are full.
    pub async fn join(
        &self,
        options: JoinOptions,
        sender: ClientSender,
    ) -> Result<Seat, SessionError> {
        let connection = ConnectionId::generate();
        let token = uuid::Uuid::new_v4().simple().to_string();

        let mut tried = Vec::new();
        loop {
            let room = self.room_with_space(&tried).await;

            let (reply, response) = oneshot::channel();
            let sent = room
                .send(RoomCommand::Join {
                    connection: connection.clone(),
                    options: options.clone(),
                    token: token.clone(),
                    sender: sender.clone(),
                    reply,
                })
                .await;

            let result = match sent {
                Ok(()) => response.await.unwrap_or(Err(SessionError::RoomClosed)),
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    self.tokens
                        .write()
                        .await
                        .insert(token.clone(), (room.id.clone(), connection.clone()));
                    info!("{} seated in room {}", connection.short(), &room.id[..8]);
                    return Ok(Seat { room, connection, token });
                }
                Err(SessionError::RoomFull) | Err(SessionError::RoomClosed) => {
                    debug!("Room {} unavailable, trying another", &room.id[..8]);
                    tried.push(room.id.clone());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resume a seat from its reconnection token.
    pub async fn reconnect(&self, token: &str, sender: ClientSender) -> Result<Seat, SessionError> {
        let (room_id, connection) = self
            .tokens
            .read()
            .await
            .get(token)
            .cloned()
            .ok_or(SessionError::UnknownReconnectToken)?;

        let room = self.rooms.read().await.get(&room_id).cloned();
        let Some(room) = room else {
            self.release(token).await;
            return Err(SessionError::UnknownReconnectToken);
        };

        let (reply, response) = oneshot::channel();
        room.send(RoomCommand::Reconnect {
            connection: connection.clone(),
            token: token.to_string(),
            sender,
            reply,
        })
        .await?;

        match response.await.unwrap_or(Err(SessionError::RoomClosed)) {
            Ok(()) => Ok(Seat {
                room,
                connection,
                token: token.to_string(),
            }),
            // Old socket not yet dropped; the token stays valid
            Err(e @ SessionError::ReconnectFailed(ReconnectError::StillConnected)) => Err(e),
            Err(e) => {
                self.release(token).await;
                Err(e)
            }
        }
    }

    /// Forget a reconnection token.
    pub async fn release(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    /// Number of open rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop closed rooms and the tokens that pointed into them.
    pub async fn cleanup(&self) {
        let closed: Vec<RoomId> = {
            let mut rooms = self.rooms.write().await;
            let closed: Vec<RoomId> = rooms
                .iter()
                .filter(|(_, room)| room.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            for id in &closed {
                rooms.remove(id);
            }
            closed
        };

        if closed.is_empty() {
            return;
        }

        self.tokens
            .write()
            .await
            .retain(|_, (room_id, _)| !closed.contains(room_id));
        debug!("Cleaned up {} closed rooms", closed.len());
    }

    /// Stop every room.
    pub async fn shutdown(&self) {
        let rooms: Vec<RoomHandle> = self.rooms.write().await.values().cloned().collect();
        for room in rooms {
            let _ = room.send(RoomCommand::Shutdown).await;
        }
    }

    /// Pick an open room with space, skipping `exclude`, or open a new one.
    async fn room_with_space(&self, exclude: &[RoomId]) -> RoomHandle {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, room| !room.is_closed());

        let open = rooms.values().find(|room| {
            !exclude.contains(&room.id) && room.player_count() < self.config.max_players
        });

        if let Some(room) = open {
            return room.clone();
        }

        let room = spawn_room(self.config.clone());
        rooms.insert(room.id.clone(), room.clone());
        room
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::game::spawn::spawn_position;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(RoomConfig::default())
    }

    fn named(name: &str) -> JoinOptions {
        JoinOptions {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    async fn join(registry: &RoomRegistry, name: &str) -> (Seat, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(64);
        let seat = registry.join(named(name), tx).await.unwrap();
        (seat, rx)
    }

    /// Next room event, skipping snapshots and the welcome.
    async fn next_event(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        loop {
            match rx.recv().await {
                Some(ServerMessage::State(_)) | Some(ServerMessage::Welcome(_)) => continue,
                Some(other) => return other,
                None => panic!("channel closed"),
            }
        }
    }

    async fn next_state(rx: &mut mpsc::Receiver<ServerMessage>) -> StateSnapshot {
        loop {
            match rx.recv().await {
                Some(ServerMessage::State(snapshot)) => return snapshot,
                Some(_) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    /// Drain everything queued so far and return the last snapshot.
    async fn settle(rx: &mut mpsc::Receiver<ServerMessage>) -> Option<StateSnapshot> {
        tokio::task::yield_now().await;
        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::State(snapshot) = msg {
                last = Some(snapshot);
            }
        }
        last
    }

    /// Move `mover` onto `target`'s spawn point.
    async fn stack(mover: &Seat, from: usize, to: usize) {
        let delta = spawn_position(to) - spawn_position(from);
        mover
            .send(RoomCommand::Move {
                connection: mover.connection.clone(),
                dx: delta.x,
                dy: delta.y,
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_welcome_precedes_snapshot() {
        let registry = registry();
        let (seat, mut rx) = join(&registry, "Alice").await;

        match rx.recv().await {
            Some(ServerMessage::Welcome(info)) => {
                assert_eq!(info.connection_id, seat.connection);
                assert_eq!(info.reconnection_token, seat.token);
                assert_eq!(info.room_id, seat.room.id());
            }
            other => panic!("expected welcome, got {:?}", other),
        }

        let snapshot = next_state(&mut rx).await;
        assert_eq!(snapshot.players.len(), 1);
        assert_eq!(snapshot.players[0].name, "Alice");
        assert_eq!(snapshot.players[0].hp, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_fills_room_before_opening_another() {
        let registry = RoomRegistry::new(RoomConfig { max_players: 2, ..Default::default() });
        let (a, _rx_a) = join(&registry, "Alice").await;
        let (b, _rx_b) = join(&registry, "Bob").await;
        let (c, _rx_c) = join(&registry, "Carol").await;

        assert_eq!(a.room.id(), b.room.id());
        assert_ne!(a.room.id(), c.room.id());
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attack_flag_resets_after_animation() {
        let registry = registry();
        let (a, mut rx) = join(&registry, "Alice").await;

        a.send(RoomCommand::Attack { connection: a.connection.clone() }).await.unwrap();
        let swinging = loop {
            let snapshot = next_state(&mut rx).await;
            if snapshot.players[0].attacking {
                break snapshot;
            }
        };
        assert!(swinging.players[0].attacking);

        // The reset timer fires on its own after 300ms
        let settled = next_state(&mut rx).await;
        assert!(!settled.players[0].attacking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_death_then_winner_then_snapshot() {
        let registry = registry();
        let (a, mut rx) = join(&registry, "Alice").await;
        let (b, _rx_b) = join(&registry, "Bob").await;
        stack(&b, 1, 0).await;

        for _ in 0..3 {
            a.send(RoomCommand::Attack { connection: a.connection.clone() }).await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        match next_event(&mut rx).await {
            ServerMessage::Death(death) => {
                assert_eq!(death.id, b.connection);
                assert_eq!(death.killer_name, "Alice");
            }
            other => panic!("expected death, got {:?}", other),
        }

        match rx.recv().await {
            Some(ServerMessage::Winner(winner)) => assert_eq!(winner.id, a.connection),
            other => panic!("expected winner, got {:?}", other),
        }

        match rx.recv().await {
            Some(ServerMessage::State(snapshot)) => {
                assert_eq!(snapshot.player(&b.connection).map(|p| p.hp), Some(0));
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_inside_window() {
        let registry = registry();
        let (_a, mut rx_a) = join(&registry, "Alice").await;
        let (b, _rx_b) = join(&registry, "Bob").await;

        b.send(RoomCommand::Leave { connection: b.connection.clone(), consented: false })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let (tx, mut rx) = mpsc::channel(64);
        let seat = registry.reconnect(&b.token, tx).await.unwrap();
        assert_eq!(seat.connection, b.connection);

        assert!(matches!(rx.recv().await, Some(ServerMessage::Welcome(_))));
        let snapshot = next_state(&mut rx).await;
        assert_eq!(snapshot.players.len(), 2);

        // Expiry must not fire once resumed
        tokio::time::sleep(Duration::from_secs(60)).await;
        let latest = settle(&mut rx_a).await;
        assert!(latest.map_or(true, |s| s.players.len() == 2));
        assert_eq!(seat.room.player_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_expiry_removes_player() {
        let registry = registry();
        let (a, mut rx_a) = join(&registry, "Alice").await;
        let (b, _rx_b) = join(&registry, "Bob").await;

        // Skip past the join snapshots
        while next_state(&mut rx_a).await.players.len() < 2 {}

        b.send(RoomCommand::Leave { connection: b.connection.clone(), consented: false })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(a.room.player_count(), 2);
        tokio::time::sleep(Duration::from_secs(31)).await;

        let after_expiry = next_state(&mut rx_a).await;
        assert_eq!(after_expiry.players.len(), 1);
        assert_eq!(after_expiry.players[0].id, a.connection);
        assert_eq!(a.room.player_count(), 1);

        let (tx, _rx) = mpsc::channel(64);
        let refused = registry.reconnect(&b.token, tx).await;
        assert!(matches!(refused, Err(SessionError::ReconnectFailed(_))));

        // Token is forgotten afterwards
        let (tx, _rx) = mpsc::channel(64);
        assert_eq!(
            registry.reconnect(&b.token, tx).await.unwrap_err(),
            SessionError::UnknownReconnectToken
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_token() {
        let registry = registry();
        let (tx, _rx) = mpsc::channel(64);
        assert_eq!(
            registry.reconnect("nope", tx).await.unwrap_err(),
            SessionError::UnknownReconnectToken
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_room_closes() {
        let registry = registry();
        let (a, _rx) = join(&registry, "Alice").await;

        a.send(RoomCommand::Leave { connection: a.connection.clone(), consented: true })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(a.room.is_closed());
        registry.cleanup().await;
        assert_eq!(registry.room_count().await, 0);

        // A new join opens a fresh room
        let (b, _rx_b) = join(&registry, "Bob").await;
        assert_ne!(a.room.id(), b.room.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_rooms() {
        let registry = registry();
        let (a, _rx) = join(&registry, "Alice").await;

        registry.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(a.room.is_closed());
        assert_eq!(
            a.send(RoomCommand::Attack { connection: a.connection.clone() }).await,
            Err(SessionError::RoomClosed)
        );
    }
}
