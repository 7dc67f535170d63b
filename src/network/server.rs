//! WebSocket Game Server
//!
//! Async WebSocket server for arena connections.
//! Seats clients in rooms and forwards their messages to the room tasks.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock, broadcast};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::game::room::RoomConfig;
use crate::game::state::ConnectionId;
use crate::network::protocol::{
    unix_millis, ClientMessage, ErrorCode, ServerError, ServerMessage,
};
use crate::network::session::{
    ClientSender, RoomCommand, RoomId, RoomRegistry, Seat, SessionError,
};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 2567;

/// Capacity of each client's outbound queue.
const OUTBOUND_CAPACITY: usize = 128;

/// How often closed rooms are swept.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// How long a closing connection may spend flushing its outbound queue.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Grace window for dropped connections.
    pub reconnect_grace: Duration,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            reconnect_grace: RoomConfig::default().reconnect_grace,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Variable set to something unparsable.
    #[error("Invalid value {value:?} for {var}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

impl ServerConfig {
    /// Read overrides from the process environment.
    ///
    /// `ARENA_BIND_ADDR` wins over `HOST`/`PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read overrides through `lookup`. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(addr) = get("ARENA_BIND_ADDR") {
            config.bind_addr = parse_var("ARENA_BIND_ADDR", &addr)?;
        } else if get("HOST").is_some() || get("PORT").is_some() {
            let host = get("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
            let port: u16 = match get("PORT") {
                Some(port) => parse_var("PORT", &port)?,
                None => DEFAULT_PORT,
            };
            config.bind_addr = parse_var("HOST", &format!("{}:{}", host, port))?;
        }

        if let Some(max) = get("ARENA_MAX_CONNECTIONS") {
            config.max_connections = parse_var("ARENA_MAX_CONNECTIONS", &max)?;
        }

        if let Some(secs) = get("ARENA_RECONNECT_GRACE_SECS") {
            let secs: u64 = parse_var("ARENA_RECONNECT_GRACE_SECS", &secs)?;
            config.reconnect_grace = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Room rules derived from this configuration.
    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            reconnect_grace: self.reconnect_grace,
            ..Default::default()
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}

// =============================================================================
// SERVER
// =============================================================================

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Session error.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Connected client state.
struct ConnectedClient {
    /// Player controlled by this connection, once seated.
    connection: Option<ConnectionId>,
    /// Room of the player.
    room_id: Option<RoomId>,
    /// Connection time.
    connected_at: Instant,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Room routing.
    registry: Arc<RoomRegistry>,
    /// Connected clients.
    clients: Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = RoomRegistry::new(config.room_config());

        Self {
            config,
            registry: Arc::new(registry),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and run until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Arena server v{} listening on {}", self.config.version, listener.local_addr()?);

        let cleanup_registry = self.registry.clone();
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_registry).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(Self::reject_overloaded(stream, addr));
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();
        self.registry.shutdown().await;

        Ok(())
    }

    /// Complete the handshake only to tell the client the server is full.
    async fn reject_overloaded(stream: TcpStream, addr: SocketAddr) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake with rejected client {} failed: {}", addr, e);
                return;
            }
        };

        let error = ServerMessage::Error(ServerError::new(
            ErrorCode::ServerOverloaded,
            "Too many connections",
        ));
        if let Ok(text) = error.to_json() {
            let _ = ws.send(Message::Text(text)).await;
        }
        let _ = ws.close(None).await;
    }

    /// Handle a new WebSocket connection.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let registry = self.registry.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Registered before the task starts so the connection cap sees it
        clients.write().await.insert(addr, ConnectedClient {
            connection: None,
            room_id: None,
            connected_at: Instant::now(),
        });

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    clients.write().await.remove(&addr);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                let _ = ws_sender.close().await;
            });

            let mut seat: Option<Seat> = None;

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let parsed = match msg {
                            Some(Ok(Message::Text(text))) => ClientMessage::from_json(&text),
                            Some(Ok(Message::Binary(data))) => ClientMessage::from_bytes(&data),
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            Some(Ok(_)) => continue,
                        };

                        match parsed {
                            Ok(client_msg) => {
                                Self::handle_client_message(
                                    addr,
                                    client_msg,
                                    &mut seat,
                                    &registry,
                                    &clients,
                                    &msg_tx,
                                ).await;
                            }
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                Self::send_error(
                                    &msg_tx,
                                    ErrorCode::InvalidMessage,
                                    "Invalid message format",
                                ).await;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Dropped without `leave`: hold the player for reconnection
            if let Some(seat) = seat.take() {
                let _ = seat.send(RoomCommand::Leave {
                    connection: seat.connection.clone(),
                    consented: false,
                }).await;
            }

            drop(msg_tx);
            if tokio::time::timeout(FLUSH_TIMEOUT, sender_task).await.is_err() {
                debug!("Outbound queue for {} not drained in time", addr);
            }

            if let Some(client) = clients.write().await.remove(&addr) {
                info!("Client {} cleaned up after {:?}", addr, client.connected_at.elapsed());
            }
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        seat: &mut Option<Seat>,
        registry: &Arc<RoomRegistry>,
        clients: &Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
        sender: &ClientSender,
    ) {
        match msg {
            ClientMessage::Join(options) => {
                if seat.is_some() {
                    Self::send_error(sender, ErrorCode::AlreadyJoined, "Already in a room").await;
                    return;
                }

                match registry.join(options, sender.clone()).await {
                    Ok(joined) => {
                        Self::record_seat(addr, &joined, clients).await;
                        *seat = Some(joined);
                    }
                    Err(e) => {
                        error!("Join failed for {}: {}", addr, e);
                        Self::send_error(sender, ErrorCode::InternalError, &e.to_string()).await;
                    }
                }
            }
            ClientMessage::Reconnect { token } => {
                if seat.is_some() {
                    Self::send_error(sender, ErrorCode::AlreadyJoined, "Already in a room").await;
                    return;
                }

                match registry.reconnect(&token, sender.clone()).await {
                    Ok(resumed) => {
                        info!("Client {} resumed {}", addr, resumed.connection.short());
                        Self::record_seat(addr, &resumed, clients).await;
                        *seat = Some(resumed);
                    }
                    Err(e) => {
                        debug!("Reconnect failed for {}: {}", addr, e);
                        Self::send_error(sender, ErrorCode::ReconnectFailed, &e.to_string()).await;
                    }
                }
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender.send(ServerMessage::Pong {
                    timestamp,
                    server_time: unix_millis(),
                }).await;
            }
            ClientMessage::Leave => {
                let Some(left) = seat.take() else {
                    debug!("Leave from unseated client {}", addr);
                    return;
                };

                let _ = left.send(RoomCommand::Leave {
                    connection: left.connection.clone(),
                    consented: true,
                }).await;
                registry.release(&left.token).await;

                if let Some(client) = clients.write().await.get_mut(&addr) {
                    client.connection = None;
                    client.room_id = None;
                }
            }
            gameplay => {
                let Some(current) = seat.as_ref() else {
                    Self::send_error(sender, ErrorCode::NotJoined, "Join a room first").await;
                    return;
                };

                let connection = current.connection.clone();
                let command = match gameplay {
                    ClientMessage::Move { dx, dy } => RoomCommand::Move { connection, dx, dy },
                    ClientMessage::Attack => RoomCommand::Attack { connection },
                    ClientMessage::Reset => RoomCommand::Reset { connection },
                    other => {
                        debug!("Unhandled {} message from {}", other.kind(), addr);
                        return;
                    }
                };

                let sent = current.send(command).await;
                if let Err(e) = sent {
                    warn!("Room of {} unavailable: {}", addr, e);
                    *seat = None;
                    Self::send_error(sender, ErrorCode::InternalError, "Room closed").await;
                }
            }
        }
    }

    async fn record_seat(
        addr: SocketAddr,
        seat: &Seat,
        clients: &Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>,
    ) {
        if let Some(client) = clients.write().await.get_mut(&addr) {
            client.connection = Some(seat.connection.clone());
            client.room_id = Some(seat.room.id().to_string());
        }
    }

    async fn send_error(sender: &ClientSender, code: ErrorCode, message: &str) {
        let _ = sender.send(ServerMessage::Error(ServerError::new(code, message))).await;
    }

    /// Run cleanup loop.
    async fn run_cleanup_loop(registry: Arc<RoomRegistry>) {
        let mut interval = interval(CLEANUP_INTERVAL);

        loop {
            interval.tick().await;
            registry.cleanup().await;
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get seated connection count.
    pub async fn seated_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|c| c.connection.is_some() && c.room_id.is_some())
            .count()
    }

    /// Get open room count.
    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    type ServeHandle = tokio::task::JoinHandle<Result<(), GameServerError>>;

    async fn start() -> (Arc<GameServer>, SocketAddr, ServeHandle) {
        start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> (Arc<GameServer>, SocketAddr, ServeHandle) {
        let server = Arc::new(GameServer::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.serve(listener).await });
        (server, addr, handle)
    }

    async fn connect(addr: SocketAddr) -> Client {
        let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        ws
    }

    async fn send(ws: &mut Client, json: &str) {
        ws.send(Message::Text(json.to_string())).await.unwrap();
    }

    async fn recv(ws: &mut Client) -> ServerMessage {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for server")
                .expect("stream ended")
                .unwrap();
            if let Message::Text(text) = frame {
                return ServerMessage::from_json(&text).unwrap();
            }
        }
    }

    async fn recv_error(ws: &mut Client) -> ErrorCode {
        loop {
            if let ServerMessage::Error(e) = recv(ws).await {
                return e.code;
            }
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 2567);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.reconnect_grace, Duration::from_secs(60));
        assert_eq!(config.room_config().max_players, 12);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("ARENA_BIND_ADDR", "127.0.0.1:9000"),
            ("ARENA_MAX_CONNECTIONS", "50"),
            ("ARENA_RECONNECT_GRACE_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.room_config().reconnect_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_config_host_and_port() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", "3000")])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000".parse().unwrap());

        let config = ServerConfig::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "3001"),
            ("ARENA_BIND_ADDR", ""),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:3001".parse().unwrap());
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup(&[("ARENA_MAX_CONNECTIONS", "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue { var: "ARENA_MAX_CONNECTIONS", value: "lots".to_string() }
        );
        assert!(ServerConfig::from_lookup(lookup(&[("PORT", "99999")])).is_err());
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = GameServer::new(ServerConfig::default());
        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_limit_reports_overload() {
        let config = ServerConfig {
            max_connections: 1,
            ..Default::default()
        };
        let (server, addr, handle) = start_with(config).await;

        let mut first = connect(addr).await;
        send(&mut first, r#"{"type":"ping","timestamp":1}"#).await;
        assert!(matches!(recv(&mut first).await, ServerMessage::Pong { timestamp: 1, .. }));

        let mut second = connect(addr).await;
        assert_eq!(recv_error(&mut second).await, ErrorCode::ServerOverloaded);
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_gameplay_requires_join() {
        let (server, addr, handle) = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, r#"{"type":"attack"}"#).await;
        assert_eq!(recv_error(&mut ws).await, ErrorCode::NotJoined);

        send(&mut ws, "garbage").await;
        assert_eq!(recv_error(&mut ws).await, ErrorCode::InvalidMessage);

        send(&mut ws, r#"{"type":"reconnect","token":"bogus"}"#).await;
        assert_eq!(recv_error(&mut ws).await, ErrorCode::ReconnectFailed);

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_join_and_play_over_websocket() {
        let (server, addr, handle) = start().await;
        let mut ws = connect(addr).await;

        send(&mut ws, r#"{"type":"join","name":"Alice","committee":"IWAB"}"#).await;
        let welcome = match recv(&mut ws).await {
            ServerMessage::Welcome(info) => info,
            other => panic!("expected welcome, got {:?}", other),
        };

        match recv(&mut ws).await {
            ServerMessage::State(snapshot) => {
                assert_eq!(snapshot.players.len(), 1);
                assert_eq!(snapshot.players[0].id, welcome.connection_id);
                assert_eq!(snapshot.players[0].name, "Alice");
                assert_eq!(snapshot.players[0].committee, "IWAB");
            }
            other => panic!("expected state, got {:?}", other),
        }

        send(&mut ws, r#"{"type":"join"}"#).await;
        assert_eq!(recv_error(&mut ws).await, ErrorCode::AlreadyJoined);

        send(&mut ws, r#"{"type":"move","dx":10,"dy":0}"#).await;
        match recv(&mut ws).await {
            ServerMessage::State(snapshot) => assert_eq!(snapshot.players[0].x, 530.0),
            other => panic!("expected state, got {:?}", other),
        }

        send(&mut ws, r#"{"type":"ping","timestamp":7}"#).await;
        match recv(&mut ws).await {
            ServerMessage::Pong { timestamp, server_time } => {
                assert_eq!(timestamp, 7);
                assert!(server_time > 0);
            }
            other => panic!("expected pong, got {:?}", other),
        }

        assert_eq!(server.room_count().await, 1);
        assert_eq!(server.seated_count().await, 1);

        server.shutdown();
        loop {
            if let ServerMessage::Shutdown { reason } = recv(&mut ws).await {
                assert!(!reason.is_empty());
                break;
            }
        }
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dropped_socket_can_reconnect() {
        let (server, addr, handle) = start().await;

        let mut first = connect(addr).await;
        send(&mut first, r#"{"type":"join","name":"Alice"}"#).await;
        let welcome = match recv(&mut first).await {
            ServerMessage::Welcome(info) => info,
            other => panic!("expected welcome, got {:?}", other),
        };
        drop(first);

        let mut second = connect(addr).await;
        let resume = format!(r#"{{"type":"reconnect","token":"{}"}}"#, welcome.reconnection_token);

        // The drop is processed asynchronously; retry until the room holds the seat
        let mut resumed = None;
        for _ in 0..50 {
            send(&mut second, &resume).await;
            match recv(&mut second).await {
                ServerMessage::Welcome(info) => {
                    resumed = Some(info);
                    break;
                }
                ServerMessage::Error(_) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        let resumed = resumed.expect("reconnect never succeeded");
        assert_eq!(resumed.connection_id, welcome.connection_id);
        assert_eq!(resumed.room_id, welcome.room_id);

        match recv(&mut second).await {
            ServerMessage::State(snapshot) => {
                assert_eq!(snapshot.players.len(), 1);
                assert_eq!(snapshot.players[0].name, "Alice");
            }
            other => panic!("expected state, got {:?}", other),
        }

        server.shutdown();
        handle.await.unwrap().unwrap();
    }
}
