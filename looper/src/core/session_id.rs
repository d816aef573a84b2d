//! Human-memorable session identifiers (`word-word-word-hhhh`).
//!
//! Collisions are tolerated by callers (they re-roll); the id is not meant to
//! be cryptographically unique.

use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "crisp", "dapper", "eager", "fancy", "gentle",
    "glad", "hazy", "humble", "jolly", "keen", "lively", "lucky", "mellow", "nimble", "plucky",
    "quiet", "rapid", "rustic", "shy", "silver", "snug", "steady", "swift", "tidy", "vivid",
    "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "canyon", "cedar", "comet", "falcon", "fern", "glacier", "harbor",
    "heron", "island", "lantern", "maple", "meadow", "otter", "pebble", "pine", "quartz",
    "raven", "reef", "river", "saddle", "sparrow", "spruce", "summit", "thistle", "tundra",
    "valley", "walrus", "willow", "yarrow", "zephyr",
];

/// Generate `adjective-adjective-noun-hhhh` using `rng`.
pub fn generate_session_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    let first = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let mut second = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    if second == first {
        second = ADJECTIVES[(ADJECTIVES.iter().position(|a| *a == first).unwrap_or(0) + 1)
            % ADJECTIVES.len()];
    }
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    let suffix: u16 = rng.r#gen();
    format!("{first}-{second}-{noun}-{suffix:04x}")
}

/// Validate that an id is safe to use as a store key segment.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}
