//! Session identifiers and the wall clock used for session expiry.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Longest session id accepted from a client.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

/// Whether a client-supplied session id is acceptable.
///
/// Ids are opaque, but they travel in URLs and log lines, so only
/// `[A-Za-z0-9_-]` up to [`MAX_SESSION_ID_LEN`] characters is allowed.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Current unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_and_distinct() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert!(is_valid_session_id(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id("../etc/passwd"));
        assert!(!is_valid_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)));
    }

    #[test]
    fn accepts_uuid_style_ids() {
        assert!(is_valid_session_id("0f8fad5b-d9cb-469f-a165-70867728950e"));
        assert!(is_valid_session_id("client_1"));
    }
}
