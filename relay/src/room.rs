//! §4.I room registry: created on first connection, destroyed after an
//! idle grace period.
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;
use troparcel_crdt::ReplicatedDoc;

/// Room names: `[A-Za-z0-9][A-Za-z0-9_. -]{0,127}`; otherwise strip
/// disallowed characters and fall back to `"default"` if empty (§4.I).
pub fn sanitise_room_name(raw: &str) -> String {
    let mut chars = raw.chars();
    let first = chars.find(|c| c.is_ascii_alphanumeric());
    let Some(first) = first else {
        warn!(raw, "room name had no usable characters, falling back to \"default\"");
        return "default".to_string();
    };
    let mut out = String::new();
    out.push(first);
    for c in raw.chars().skip_while(|c| *c != first).skip(1) {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ' ' | '-') {
            out.push(c);
        }
        if out.len() >= 128 {
            break;
        }
    }
    if out.is_empty() {
        warn!(raw, "room name had no usable characters, falling back to \"default\"");
        "default".to_string()
    } else {
        out
    }
}

pub struct RoomActivityEvent {
    pub room: String,
    pub kind: ActivityKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActivityKind {
    Connected,
    Disconnected,
    Updated,
}

pub struct Room {
    pub name: String,
    pub doc: RwLock<ReplicatedDoc>,
    pub connection_count: std::sync::atomic::AtomicUsize,
    pub last_active: RwLock<Instant>,
    pub activity: broadcast::Sender<ActivityKind>,
}

impl Room {
    fn new(name: String, doc: ReplicatedDoc) -> Self {
        let (activity, _) = broadcast::channel(256);
        Self {
            name,
            doc: RwLock::new(doc),
            connection_count: std::sync::atomic::AtomicUsize::new(0),
            last_active: RwLock::new(Instant::now()),
            activity,
        }
    }

    pub fn touch(&self) {
        *self.last_active.write() = Instant::now();
    }

    pub fn is_idle(&self, grace: Duration) -> bool {
        self.connection_count.load(std::sync::atomic::Ordering::SeqCst) == 0
            && self.last_active.read().elapsed() > grace
    }
}

pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    idle_grace: Duration,
}

impl RoomRegistry {
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            idle_grace,
        }
    }

    pub fn get_or_create(&self, name: &str, initial_doc: impl FnOnce() -> ReplicatedDoc) -> Arc<Room> {
        if let Some(room) = self.rooms.get(name) {
            room.touch();
            return room.clone();
        }
        let room = Arc::new(Room::new(name.to_string(), initial_doc()));
        self.rooms.insert(name.to_string(), room.clone());
        room
    }

    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).map(|r| r.clone())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    /// Destroys rooms with no connections that have been idle past the
    /// configured grace period.
    pub fn sweep_idle(&self) -> Vec<String> {
        let idle: Vec<String> = self
            .rooms
            .iter()
            .filter(|e| e.value().is_idle(self.idle_grace))
            .map(|e| e.key().clone())
            .collect();
        for name in &idle {
            self.rooms.remove(name);
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_disallowed_characters() {
        assert_eq!(sanitise_room_name("my room!@#$"), "my room");
    }

    #[test]
    fn falls_back_to_default_when_empty_after_filtering() {
        assert_eq!(sanitise_room_name("!!!"), "default");
        assert_eq!(sanitise_room_name(""), "default");
    }

    #[test]
    fn accepts_a_normal_room_name() {
        assert_eq!(sanitise_room_name("project-alpha_v2.final"), "project-alpha_v2.final");
    }

    #[test]
    fn get_or_create_returns_same_room_on_repeat() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let a = registry.get_or_create("room1", || ReplicatedDoc::new(1));
        let b = registry.get_or_create("room1", || ReplicatedDoc::new(1));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn sweep_idle_removes_only_rooms_past_grace_with_no_connections() {
        let registry = RoomRegistry::new(Duration::from_millis(0));
        registry.get_or_create("room1", || ReplicatedDoc::new(1));
        std::thread::sleep(Duration::from_millis(5));
        let swept = registry.sweep_idle();
        assert_eq!(swept, vec!["room1".to_string()]);
        assert_eq!(registry.room_count(), 0);
    }
}
