//! §4.I auth: optional per-room bearer tokens, constant-time compared.
use std::collections::HashMap;

/// Hand-rolled because no constant-time-compare crate appears anywhere in
/// the reference corpus; this is the one place in the relay where timing
/// matters enough to justify writing it by hand instead of pulling one in.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        // Still walk the full length of `a` against itself so the early
        // return doesn't leak length via timing on the common path.
        let mut diff = 0u8;
        for &byte in a {
            diff |= byte;
        }
        let _ = diff;
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

pub struct AuthTable {
    tokens: HashMap<String, String>,
}

pub enum AuthResult {
    /// No token configured for this room: open access.
    NotRequired,
    Authorized,
    Unauthorized,
}

impl AuthTable {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn check(&self, room: &str, provided: Option<&str>) -> AuthResult {
        match self.tokens.get(room) {
            None => AuthResult::NotRequired,
            Some(expected) => match provided {
                Some(token) if constant_time_eq(expected, token) => AuthResult::Authorized,
                _ => AuthResult::Unauthorized,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_strings_match() {
        assert!(constant_time_eq("abcdef1234567890", "abcdef1234567890"));
    }

    #[test]
    fn different_length_does_not_match() {
        assert!(!constant_time_eq("short", "much-longer-token"));
    }

    #[test]
    fn single_byte_difference_does_not_match() {
        assert!(!constant_time_eq("abcdef1234567890", "abcdef1234567891"));
    }

    #[test]
    fn room_without_configured_token_is_open() {
        let table = AuthTable::new(HashMap::new());
        assert!(matches!(table.check("any-room", None), AuthResult::NotRequired));
    }

    #[test]
    fn wrong_token_is_rejected() {
        let mut tokens = HashMap::new();
        tokens.insert("room1".to_string(), "correct-token-value".to_string());
        let table = AuthTable::new(tokens);
        assert!(matches!(table.check("room1", Some("wrong-token")), AuthResult::Unauthorized));
        assert!(matches!(table.check("room1", Some("correct-token-value")), AuthResult::Authorized));
    }
}
