//! Game Logic Module
//!
//! Everything that decides what happens in a room. No I/O, no clocks:
//! callers pass the current instant in and get timer requests back.
//!
//! ## Module Structure
//!
//! - `state`: Connection ids, player state, arena state
//! - `spawn`: Deterministic spawn rings
//! - `identity`: Name sanitization, committee and color assignment
//! - `combat`: Punch range and target selection
//! - `events`: Death and winner announcements
//! - `room`: Authoritative room state machine

pub mod state;
pub mod spawn;
pub mod identity;
pub mod combat;
pub mod events;
pub mod room;

// Re-export key types
pub use state::{ArenaState, ConnectionId, PlayerState};
pub use events::{DeathEvent, RoomEvent, WinnerEvent};
pub use room::{
    GameRoom, JoinOptions, ReconnectError, RoomConfig, RoomOutcome, TimerKind, TimerKey,
    TimerRequest,
};
