//! State Hashing
//!
//! SHA-256 digest over replicated arena state. Clients compare the hash
//! carried by each snapshot to detect a diverged mirror.

use sha2::{Sha256, Digest};
use super::vec2::Vec2;

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Hasher for replicated state.
///
/// Order of updates matters: the same fields fed in a different
/// order produce a different hash.
pub struct StateHasher {
    hasher: Sha256,
}

impl StateHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Create hasher for arena state.
    pub fn for_arena_state() -> Self {
        Self::new(b"COMMITTEE_ARENA_STATE_V1")
    }

    /// Update with a u32 value (little-endian).
    #[inline]
    pub fn update_u32(&mut self, value: u32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an i32 value (little-endian).
    #[inline]
    pub fn update_i32(&mut self, value: i32) {
        self.hasher.update(value.to_le_bytes());
    }

    /// Update with an f64 value (IEEE-754 bits, little-endian).
    #[inline]
    pub fn update_f64(&mut self, value: f64) {
        self.hasher.update(value.to_bits().to_le_bytes());
    }

    /// Update with a Vec2.
    #[inline]
    pub fn update_vec2(&mut self, value: Vec2) {
        self.update_f64(value.x);
        self.update_f64(value.y);
    }

    /// Update with a boolean.
    #[inline]
    pub fn update_bool(&mut self, value: bool) {
        self.hasher.update([value as u8]);
    }

    /// Update with a length-prefixed string.
    #[inline]
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.hasher.update(value.as_bytes());
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> StateHash {
        self.hasher.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_hasher_determinism() {
        let make_hash = || {
            let mut hasher = StateHasher::for_arena_state();
            hasher.update_str("player-1");
            hasher.update_vec2(Vec2::new(400.0, 300.0));
            hasher.update_i32(3);
            hasher.update_bool(false);
            hasher.finalize()
        };

        assert_eq!(make_hash(), make_hash());
    }

    #[test]
    fn test_hash_order_matters() {
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(1);
            h.update_u32(2);
            h.finalize()
        };

        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_u32(2);
            h.update_u32(1);
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }

    #[test]
    fn test_string_boundaries() {
        // "ab" + "c" must not collide with "a" + "bc"
        let hash1 = {
            let mut h = StateHasher::new(b"test");
            h.update_str("ab");
            h.update_str("c");
            h.finalize()
        };
        let hash2 = {
            let mut h = StateHasher::new(b"test");
            h.update_str("a");
            h.update_str("bc");
            h.finalize()
        };

        assert_ne!(hash1, hash2);
    }
}
