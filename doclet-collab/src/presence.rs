//! Deterministic display names for connected clients.
//!
//! Every participant needs a recognizable label, but the hub keeps no
//! directory of users. Instead the label is derived from the client id:
//!
//! ```text
//! client_id ──► FNV-1a (32 bit) ──┬── h % 10        ──► adjective
//!                                 └── (h >> 8) % 10 ──► noun
//!                                                       │
//!                                          "Clever Summit"
//! ```
//!
//! The hash and both word lists are fixed constants, so a client that
//! reconnects (to this instance or any other) gets the same name back.

// ───────────────────────────────────────────────────────────────────
// Word lists
// ───────────────────────────────────────────────────────────────────

const ADJECTIVES: [&str; 10] = [
    "Brisk", "Calm", "Clever", "Golden", "Mellow",
    "Quick", "Quiet", "Sharp", "Sunny", "Witty",
];

const NOUNS: [&str; 10] = [
    "Comet", "Falcon", "Harbor", "Lighthouse", "Meadow",
    "Orchard", "River", "Sparrow", "Summit", "Willow",
];

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

// ───────────────────────────────────────────────────────────────────
// Naming
// ───────────────────────────────────────────────────────────────────

/// 32-bit FNV-1a over the raw bytes of `input`.
pub fn fnv1a_32(input: &[u8]) -> u32 {
    input.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Stable, human-readable name for a client id.
///
/// The adjective comes from the low bits of the hash and the noun from
/// the bits above the first byte, so the two picks are independent.
pub fn display_name(client_id: &str) -> String {
    let hash = fnv1a_32(client_id.as_bytes()) as usize;
    let adjective = ADJECTIVES[hash % ADJECTIVES.len()];
    let noun = NOUNS[(hash >> 8) % NOUNS.len()];
    format!("{adjective} {noun}")
}
