//! Network Layer
//!
//! WebSocket server, wire protocol and the room tasks that serialize
//! access to each [`GameRoom`](crate::game::room::GameRoom).

pub mod protocol;
pub mod session;
pub mod server;

pub use protocol::{
    ClientMessage, ServerMessage, ErrorCode, PlayerSnapshot, StateSnapshot, WelcomeInfo,
};
pub use session::{RoomCommand, RoomHandle, RoomRegistry, Seat, SessionError};
pub use server::{ConfigError, GameServer, GameServerError, ServerConfig};
