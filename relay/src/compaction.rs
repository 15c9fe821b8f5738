//! Periodic tombstone and orphan cleanup pass, run on a timer (§4.I /
//! §6.3 `COMPACTION_HOURS`) and exposed via `POST /api/rooms/:name/compact`.
use std::time::Duration;

use tracing::info;

use crate::room::RoomRegistry;
use crate::store::RoomStore;

pub struct CompactionReport {
    pub room: String,
    pub orphaned_uuids_removed: usize,
}

/// Runs one compaction pass over every live room: drops tombstones older
/// than `tombstone_max_age`, purges uuids no longer referenced by any
/// annotation, prunes buckets left empty by that, then persists the result.
pub fn compact_room(registry: &RoomRegistry, store: &RoomStore, room_name: &str, tombstone_max_age: Duration, now_unix: i64) -> Option<CompactionReport> {
    let room = registry.get(room_name)?;
    let mut doc = room.doc.write();
    doc.purge_tombstones(now_unix, tombstone_max_age.as_secs() as i64);
    let orphaned = doc.purge_orphaned_uuids();
    doc.prune_empty_buckets();
    if let Err(err) = store.save(room_name, &doc) {
        tracing::warn!(room = room_name, error = %err, "failed to persist room after compaction");
    }
    info!(room = room_name, removed = orphaned.len(), "compacted room");
    Some(CompactionReport {
        room: room_name.to_string(),
        orphaned_uuids_removed: orphaned.len(),
    })
}

pub fn compact_all(registry: &RoomRegistry, store: &RoomStore, tombstone_max_age: Duration, now_unix: i64) -> Vec<CompactionReport> {
    registry
        .room_names()
        .into_iter()
        .filter_map(|name| compact_room(registry, store, &name, tombstone_max_age, now_unix))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use troparcel_crdt::ReplicatedDoc;

    #[test]
    fn compacting_an_unknown_room_is_a_noop() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let dir = tempdir().unwrap();
        let store = RoomStore::open(dir.path()).unwrap();
        assert!(compact_room(&registry, &store, "ghost", Duration::from_secs(60), 0).is_none());
    }

    #[test]
    fn compacting_a_live_room_persists_it() {
        let registry = RoomRegistry::new(Duration::from_secs(60));
        let dir = tempdir().unwrap();
        let store = RoomStore::open(dir.path()).unwrap();
        registry.get_or_create("room1", || ReplicatedDoc::new(1));
        let report = compact_room(&registry, &store, "room1", Duration::from_secs(60), 0).unwrap();
        assert_eq!(report.room, "room1");
        assert!(store.load("room1").unwrap().is_some());
    }
}
