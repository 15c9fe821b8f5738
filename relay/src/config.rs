//! §6.3 environment configuration.
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

pub const DEFAULT_MIN_TOKEN_LENGTH: usize = 16;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub port: u16,
    pub host: IpAddr,
    pub persistence_dir: PathBuf,
    pub auth_tokens: HashMap<String, String>,
    pub max_rooms: usize,
    pub max_conns_per_ip: usize,
    pub monitor_origin: Option<String>,
    pub monitor_token: Option<String>,
    pub min_token_length: usize,
    pub compaction_interval: Duration,
    pub tombstone_max_age: Duration,
    pub room_idle_grace: Duration,
}

impl RelayConfig {
    /// Loads configuration from the environment (§6.3), applying the
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        let config = Self {
            port: env_parse("PORT", 2468),
            host: env_parse("HOST", IpAddr::from([0, 0, 0, 0])),
            persistence_dir: std::env::var("PERSISTENCE_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("./data")),
            auth_tokens: parse_auth_tokens(&std::env::var("AUTH_TOKENS").unwrap_or_default()),
            max_rooms: env_parse("MAX_ROOMS", 100),
            max_conns_per_ip: env_parse("MAX_CONNS_PER_IP", 10),
            monitor_origin: std::env::var("MONITOR_ORIGIN").ok(),
            monitor_token: std::env::var("MONITOR_TOKEN").ok(),
            min_token_length: env_parse("MIN_TOKEN_LENGTH", DEFAULT_MIN_TOKEN_LENGTH),
            compaction_interval: Duration::from_secs(env_parse::<u64>("COMPACTION_HOURS", 6) * 3600),
            tombstone_max_age: Duration::from_secs(env_parse::<u64>("TOMBSTONE_MAX_DAYS", 30) * 24 * 3600),
            room_idle_grace: Duration::from_secs(60),
        };
        config.warn_on_weak_tokens();
        config
    }

    fn warn_on_weak_tokens(&self) {
        for (room, token) in &self.auth_tokens {
            if token.len() < self.min_token_length {
                warn!(room, len = token.len(), min = self.min_token_length, "auth token shorter than minimum length");
            }
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parses `room:token,room2:token2`.
fn parse_auth_tokens(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| pair.split_once(':'))
        .map(|(room, token)| (room.to_string(), token.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_room_tokens() {
        let tokens = parse_auth_tokens("roomA:tok-aaaaaaaaaaaa,roomB:tok-bbbbbbbbbbbb");
        assert_eq!(tokens.get("roomA"), Some(&"tok-aaaaaaaaaaaa".to_string()));
        assert_eq!(tokens.get("roomB"), Some(&"tok-bbbbbbbbbbbb".to_string()));
    }

    #[test]
    fn empty_token_string_yields_no_rooms() {
        assert!(parse_auth_tokens("").is_empty());
    }
}
