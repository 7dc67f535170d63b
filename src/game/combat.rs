//! Hit Detection
//!
//! Proximity checks for punches.

use crate::core::vec2::Vec2;
use crate::game::state::{ArenaState, ConnectionId, PlayerState};

/// Check if a target stands strictly inside the punch radius.
#[inline]
pub fn in_punch_range(attacker: Vec2, target: Vec2, punch_radius: f64) -> bool {
    attacker.distance(target) < punch_radius
}

/// Check whether `attacker` can land a punch on `target`.
///
/// Self-hits and already-dead targets never count.
pub fn can_hit(attacker: &PlayerState, target: &PlayerState, punch_radius: f64) -> bool {
    if attacker.id == target.id {
        return false;
    }

    if !target.is_alive() {
        return false;
    }

    in_punch_range(attacker.position, target.position, punch_radius)
}

/// Collect everyone the attacker's punch lands on, in arena order.
pub fn punch_targets(
    arena: &ArenaState,
    attacker_id: &ConnectionId,
    punch_radius: f64,
) -> Vec<ConnectionId> {
    let Some(attacker) = arena.get(attacker_id) else {
        return Vec::new();
    };

    arena
        .iter()
        .filter(|target| can_hit(attacker, target, punch_radius))
        .map(|target| target.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUNCH_RADIUS: f64 = 33.0;

    fn player_at(id: &str, x: f64, y: f64, hp: i32) -> PlayerState {
        PlayerState::new(
            ConnectionId::from(id),
            id.to_string(),
            "IWAB".to_string(),
            0,
            Vec2::new(x, y),
            hp,
        )
    }

    #[test]
    fn test_range_is_strict() {
        let origin = Vec2::new(400.0, 300.0);
        assert!(in_punch_range(origin, Vec2::new(410.0, 300.0), PUNCH_RADIUS));
        assert!(in_punch_range(origin, Vec2::new(432.9, 300.0), PUNCH_RADIUS));
        assert!(!in_punch_range(origin, Vec2::new(433.0, 300.0), PUNCH_RADIUS));
        assert!(!in_punch_range(origin, Vec2::new(500.0, 300.0), PUNCH_RADIUS));
    }

    #[test]
    fn test_no_self_hit() {
        let a = player_at("a", 400.0, 300.0, 3);
        assert!(!can_hit(&a, &a, PUNCH_RADIUS));
    }

    #[test]
    fn test_dead_target_skipped() {
        let a = player_at("a", 400.0, 300.0, 3);
        let b = player_at("b", 405.0, 300.0, 0);
        assert!(!can_hit(&a, &b, PUNCH_RADIUS));
    }

    #[test]
    fn test_punch_targets_in_arena_order() {
        let mut arena = ArenaState::new();
        arena.insert(player_at("far", 500.0, 300.0, 3));
        arena.insert(player_at("c", 400.0, 320.0, 3));
        arena.insert(player_at("a", 400.0, 300.0, 3));
        arena.insert(player_at("b", 410.0, 300.0, 3));
        arena.insert(player_at("dead", 401.0, 300.0, 0));

        let targets = punch_targets(&arena, &ConnectionId::from("a"), PUNCH_RADIUS);
        let names: Vec<&str> = targets.iter().map(|id| id.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_unknown_attacker_hits_nothing() {
        let mut arena = ArenaState::new();
        arena.insert(player_at("a", 400.0, 300.0, 3));
        assert!(punch_targets(&arena, &ConnectionId::from("ghost"), PUNCH_RADIUS).is_empty());
    }
}
