//! Core primitives.
//!
//! Geometry and hashing shared by the room logic and the wire layer.

pub mod vec2;
pub mod hash;

pub use vec2::Vec2;
pub use hash::{StateHash, StateHasher};
