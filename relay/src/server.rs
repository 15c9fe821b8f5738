//! Shared, clonable handle threaded through every warp filter and the
//! websocket handler.
use std::time::Duration;

use crate::auth::AuthTable;
use crate::config::RelayConfig;
use crate::ratelimit::RateLimiter;
use crate::room::RoomRegistry;
use crate::store::RoomStore;

pub struct SharedState {
    pub registry: RoomRegistry,
    pub store: RoomStore,
    pub auth: AuthTable,
    pub rate_limiter: RateLimiter,
    pub monitor_token: Option<String>,
    pub max_rooms: usize,
    pub tombstone_max_age: Duration,
}

impl SharedState {
    pub fn new(config: &RelayConfig, store: RoomStore) -> Self {
        Self {
            registry: RoomRegistry::new(config.room_idle_grace),
            store,
            auth: AuthTable::new(config.auth_tokens.clone()),
            rate_limiter: RateLimiter::new(config.max_conns_per_ip, config.max_rooms),
            monitor_token: config.monitor_token.clone(),
            max_rooms: config.max_rooms,
            tombstone_max_age: config.tombstone_max_age,
        }
    }

    /// Persists every live room; used on graceful shutdown.
    pub fn flush_all(&self) {
        for name in self.registry.room_names() {
            if let Some(room) = self.registry.get(&name) {
                if let Err(err) = self.store.save(&name, &room.doc.read()) {
                    tracing::warn!(room = %name, error = %err, "failed to flush room on shutdown");
                }
            }
        }
    }

    /// Wall-clock seconds since the epoch, used to age out tombstones.
    pub fn clock_unix_secs(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}
