//! Engine configuration (§4.G defaults, §6.1).
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::uri::ConnectionTarget;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub room: String,
    pub user_id: String,
    pub target: Option<ConnectionTarget>,
    pub debounce: Duration,
    pub safety_net_interval: Option<Duration>,
    pub max_note_size: usize,
    pub max_metadata_size: usize,
    pub max_ghost_apply_retries: u32,
    pub max_backups: usize,
    pub tombstone_window: Duration,
    pub data_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            room: "default".to_string(),
            user_id: String::new(),
            target: None,
            debounce: Duration::from_secs(2),
            safety_net_interval: Some(Duration::from_secs(120)),
            max_note_size: 1024 * 1024,
            max_metadata_size: 64 * 1024,
            max_ghost_apply_retries: 3,
            max_backups: 10,
            tombstone_window: Duration::from_secs(30 * 24 * 3600),
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// Builds a config from a connection string plus a room/user, applying
    /// §6.1: an empty connection string means "use individual fields";
    /// a non-empty one is parsed and merged in, with explicit fields
    /// always winning over whatever the URI would imply.
    pub fn with_connection_string(mut self, uri: &str) -> anyhow::Result<Self> {
        if !uri.is_empty() {
            let parsed = crate::uri::parse_connection_string(uri)?;
            self.target = Some(parsed);
        }
        Ok(self)
    }

    pub fn vault_path(&self) -> PathBuf {
        self.data_dir
            .join("vault")
            .join(format!("{}_{}.json", sanitise_room(&self.room), self.user_id))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups").join(sanitise_room(&self.room))
    }
}

/// Room names are free text from the host; sanitise the same way the relay
/// does (§4.I) before using one as a filesystem path component.
pub fn sanitise_room(room: &str) -> String {
    let filtered: String = room
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | ' '))
        .take(128)
        .collect();
    if filtered.is_empty() {
        warn!(room, "room name had no usable characters, falling back to \"default\"");
        "default".to_string()
    } else {
        filtered
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".troparcel")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_sanitisation_strips_illegal_chars() {
        assert_eq!(sanitise_room("My Room!@#"), "My Room");
        assert_eq!(sanitise_room("???"), "default");
    }

    #[test]
    fn empty_connection_string_is_a_noop() {
        let cfg = EngineConfig::default().with_connection_string("").unwrap();
        assert!(cfg.target.is_none());
    }
}
