//! # Committee Arena Server
//!
//! Authoritative room server for Committee Arena, a multiplayer punch
//! game: players walk around an 800x600 arena, punch whoever stands close
//! enough, and the last one standing wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    ARENA SERVER                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  ├── vec2.rs     - 2D vector, distance, arena clamping       │
//! │  └── hash.rs     - Snapshot integrity hashing                │
//! │                                                              │
//! │  game/           - Room rules (no I/O)                       │
//! │  ├── state.rs    - Connection ids, player and arena state    │
//! │  ├── spawn.rs    - Two-ring spawn distribution               │
//! │  ├── identity.rs - Names, committees, colors                 │
//! │  ├── combat.rs   - Punch hit detection                       │
//! │  ├── events.rs   - Death / winner announcements              │
//! │  └── room.rs     - Authoritative room state machine          │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── server.rs   - WebSocket server, configuration           │
//! │  ├── protocol.rs - Message types                             │
//! │  └── session.rs  - Room tasks, timers, room registry         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering Guarantee
//!
//! Each room runs in a single task fed by one command queue. Joins,
//! leaves, player messages and timer firings are applied one at a time,
//! each to completion. Events an operation produces are broadcast in the
//! order they occurred, followed by one state snapshot.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::vec2::Vec2;
pub use game::room::{GameRoom, JoinOptions, RoomConfig, RoomOutcome};
pub use game::state::{ArenaState, ConnectionId, PlayerState};
pub use network::server::{GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
