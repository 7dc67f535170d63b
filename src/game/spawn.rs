//! Spawn Distribution
//!
//! Deterministic placement of players on two concentric rings around the
//! arena center. Index `i` always maps to the same point, so joins and
//! resets are reproducible.

use std::f64::consts::TAU;

use crate::core::vec2::Vec2;

/// Center of both spawn rings.
pub const SPAWN_CENTER: Vec2 = Vec2::new(400.0, 300.0);

/// Slots per ring.
pub const SLOTS_PER_RING: usize = 12;

/// Radius of the inner ring (indices 0..12).
pub const INNER_RING_RADIUS: f64 = 120.0;

/// Radius of the outer ring (indices 12 and above).
pub const OUTER_RING_RADIUS: f64 = 180.0;

/// Spawn position for the zero-based player `index`.
pub fn spawn_position(index: usize) -> Vec2 {
    let (radius, slot) = if index < SLOTS_PER_RING {
        (INNER_RING_RADIUS, index)
    } else {
        (OUTER_RING_RADIUS, index - SLOTS_PER_RING)
    };

    let angle = (slot as f64 / SLOTS_PER_RING as f64) * TAU;
    Vec2::new(
        SPAWN_CENTER.x + angle.cos() * radius,
        SPAWN_CENTER.y + angle.sin() * radius,
    )
}
