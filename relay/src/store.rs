//! sled-backed per-room persistence and log-safe IP masking (§4.I: "IP
//! addresses in logs MUST be masked").
use std::net::IpAddr;
use std::path::Path;

use thiserror::Error;
use troparcel_crdt::encode::{decode_state, encode_state};
use troparcel_crdt::ReplicatedDoc;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("crdt encode/decode error: {0}")]
    Crdt(#[from] troparcel_crdt::CrdtError),
}

pub struct RoomStore {
    db: sled::Db,
}

impl RoomStore {
    pub fn open(persistence_dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(persistence_dir).ok();
        let db = sled::open(persistence_dir.join("rooms.sled"))?;
        Ok(Self { db })
    }

    pub fn load(&self, room: &str) -> Result<Option<ReplicatedDoc>, StoreError> {
        match self.db.get(room)? {
            Some(bytes) => Ok(Some(decode_state(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn save(&self, room: &str, doc: &ReplicatedDoc) -> Result<(), StoreError> {
        let bytes = encode_state(doc)?;
        self.db.insert(room, bytes)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn room_names(&self) -> Vec<String> {
        self.db
            .iter()
            .keys()
            .filter_map(|k| k.ok())
            .map(|k| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }
}

/// Masks the last octet (v4) or last 80 bits (v6) so logs never carry a
/// fully identifying address.
pub fn mask_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.xxx")
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!("{:x}:{:x}:xxxx:xxxx:xxxx:xxxx:xxxx:xxxx", segments[0], segments[1])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn masks_ipv4_last_octet() {
        let ip: IpAddr = "203.0.113.42".parse().unwrap();
        assert_eq!(mask_ip(ip), "203.0.113.xxx");
    }

    #[test]
    fn masks_ipv6_tail() {
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(mask_ip(ip), "2001:db8:xxxx:xxxx:xxxx:xxxx:xxxx:xxxx");
    }

    #[test]
    fn save_and_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = RoomStore::open(dir.path()).unwrap();
        let doc = ReplicatedDoc::new(1);
        store.save("room1", &doc).unwrap();
        let loaded = store.load("room1").unwrap().unwrap();
        assert_eq!(loaded.schema_version, 1);
    }

    #[test]
    fn load_of_unknown_room_is_none() {
        let dir = tempdir().unwrap();
        let store = RoomStore::open(dir.path()).unwrap();
        assert!(store.load("nope").unwrap().is_none());
    }
}
