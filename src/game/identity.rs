//! Player Identity
//!
//! Display name sanitization, committee defaults and color assignment
//! for joining players.

use crate::game::state::{ArenaState, ConnectionId};

/// Shortest accepted display name (in characters).
pub const NAME_MIN_LEN: usize = 2;

/// Longest accepted display name (in characters).
pub const NAME_MAX_LEN: usize = 20;

/// Committee used when the client does not declare one.
pub const DEFAULT_COMMITTEE: &str = "Leadership Events Directors";

/// Color requested on behalf of clients that send none.
pub const DEFAULT_COLOR: u32 = 0xFFFFFF;

/// Fallback colors handed out when a requested color is taken.
pub const COLOR_PALETTE: [u32; 12] = [
    0xFF6B6B, 0x4ECDC4, 0xFFD93D, 0x95E1D3, 0xF38181, 0xAA96DA, 0xFCACA6, 0x6BCF7F, 0x4A90E2,
    0xE74C3C, 0x9B59B6, 0x3498DB,
];

#[inline]
fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_'
}

/// Generated name for players whose requested name is unusable.
pub fn guest_name(id: &ConnectionId) -> String {
    let suffix: String = id
        .as_str()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(4)
        .collect();

    if suffix.is_empty() {
        "Guest".to_string()
    } else {
        format!("Guest-{}", suffix)
    }
}

/// Sanitize a requested display name.
///
/// Disallowed characters are dropped, surrounding whitespace trimmed and
/// the result cut to [`NAME_MAX_LEN`]. Anything shorter than
/// [`NAME_MIN_LEN`] afterwards is replaced by a guest name.
pub fn sanitize_name(requested: Option<&str>, id: &ConnectionId) -> String {
    let filtered: String = requested
        .unwrap_or_default()
        .chars()
        .filter(|c| is_name_char(*c))
        .collect();

    let truncated: String = filtered.trim().chars().take(NAME_MAX_LEN).collect();
    let name = truncated.trim_end();

    if name.chars().count() < NAME_MIN_LEN {
        guest_name(id)
    } else {
        name.to_string()
    }
}

/// Resolve the committee label, falling back to [`DEFAULT_COMMITTEE`].
pub fn resolve_committee(requested: Option<&str>) -> String {
    match requested.map(str::trim) {
        Some(committee) if !committee.is_empty() => committee.to_string(),
        _ => DEFAULT_COMMITTEE.to_string(),
    }
}

/// Pick a display color that no current player uses.
///
/// The requested color wins when free. Otherwise the first free palette
/// entry is used; with the palette exhausted the requested color is
/// returned even though it duplicates another player's.
pub fn resolve_color(requested: Option<u32>, arena: &ArenaState) -> u32 {
    let requested = requested.unwrap_or(DEFAULT_COLOR) & 0xFF_FFFF;

    if !arena.color_in_use(requested) {
        return requested;
    }

    COLOR_PALETTE
        .iter()
        .copied()
        .find(|color| !arena.color_in_use(*color))
        .unwrap_or(requested)
}
