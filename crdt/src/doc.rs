//! §3.2/§4.C: the replicated annotation document.
use std::collections::BTreeMap;

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

use crate::clock::{Author, PushClock, PushSeq};
use crate::grow::GrowMap;
use crate::id::{ItemId, PhotoChecksum};
use crate::lww::LwwMap;
use crate::orset::OrSet;

/// A URI identifying a metadata property, e.g. `dc:title`.
pub type PropertyUri = String;

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct MetadataValue {
    pub text: String,
    pub kind: String,
    pub lang: Option<String>,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct NoteValue {
    pub html: String,
    pub text: String,
    pub lang: Option<String>,
    pub photo: Option<PhotoChecksum>,
    pub selection: Option<String>,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct SelectionValue {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
    pub angle: i32,
    pub photo: Option<PhotoChecksum>,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct TranscriptionValue {
    pub text: String,
    pub data: Option<String>,
    pub photo: Option<PhotoChecksum>,
    pub selection: Option<String>,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct TagValue {
    pub name: String,
    pub color: Option<String>,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct ListValue {
    pub name: String,
    pub member: bool,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct TemplateValue {
    pub label: String,
    pub kind: String,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct ListNodeValue {
    pub name: String,
    pub parent: Option<String>,
}

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct AliasValue {
    pub new_identity: String,
    pub created_at: i64,
}

/// Local-only namespaces, enforced on push (§3.3): never allowed into the
/// replicated document.
pub fn is_local_only_tag(display_name: &str) -> bool {
    display_name.starts_with('@')
}

pub fn is_local_only_property(uri: &str) -> bool {
    uri.starts_with("troparcel:") || uri.starts_with("https://troparcel.org/ns/")
}

/// The nine sub-collections of a single item's annotation state, plus the
/// two registry/redirect maps (§3.2).
#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct ItemBucket {
    pub metadata: LwwMap<PropertyUri, MetadataValue>,
    pub photo_metadata: BTreeMap<String, LwwMap<PropertyUri, MetadataValue>>,
    pub tags: BTreeMap<String, OrSet<TagValue>>,
    pub notes: LwwMap<String, NoteValue>,
    pub selections: LwwMap<String, SelectionValue>,
    pub selection_meta: BTreeMap<String, LwwMap<PropertyUri, MetadataValue>>,
    pub selection_notes: LwwMap<String, NoteValue>,
    pub transcriptions: LwwMap<String, TranscriptionValue>,
    pub lists: BTreeMap<String, OrSet<ListValue>>,
    pub uuids: GrowMap<String, String>,
    pub aliases: GrowMap<String, AliasValue>,
}

impl ItemBucket {
    /// I4/§3.5: a bucket may only be pruned once every sub-collection is
    /// empty of active entries and every registry entry is orphaned; that
    /// orphan check is the relay's job at compaction, this just answers
    /// "is there anything at all left to look at".
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
            && self.photo_metadata.values().all(|m| m.is_empty())
            && self.tags.values().all(|t| t.is_empty())
            && self.notes.is_empty()
            && self.selections.is_empty()
            && self.selection_meta.values().all(|m| m.is_empty())
            && self.selection_notes.is_empty()
            && self.transcriptions.is_empty()
            && self.lists.values().all(|l| l.is_empty())
            && self.uuids.is_empty()
            && self.aliases.is_empty()
    }

    pub fn merge(&mut self, other: &Self) {
        self.metadata.merge(&other.metadata, false);
        for (checksum, incoming) in &other.photo_metadata {
            self.photo_metadata
                .entry(checksum.clone())
                .or_default()
                .merge(incoming, false);
        }
        for (name, incoming) in &other.tags {
            self.tags.entry(name.clone()).or_default().merge(incoming);
        }
        self.notes.merge(&other.notes, true);
        self.selections.merge(&other.selections, true);
        for (key, incoming) in &other.selection_meta {
            self.selection_meta
                .entry(key.clone())
                .or_default()
                .merge(incoming, false);
        }
        self.selection_notes.merge(&other.selection_notes, true);
        self.transcriptions.merge(&other.transcriptions, true);
        for (key, incoming) in &other.lists {
            self.lists.entry(key.clone()).or_default().merge(incoming);
        }
        self.uuids.merge(&other.uuids);
        self.aliases.merge(&other.aliases);
    }

    pub fn filter_since(&self, sv: &PushClock) -> Self {
        Self {
            metadata: self.metadata.filter_since(sv),
            photo_metadata: self
                .photo_metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.filter_since(sv)))
                .collect(),
            tags: self
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.filter_since(sv)))
                .collect(),
            notes: self.notes.filter_since(sv),
            selections: self.selections.filter_since(sv),
            selection_meta: self
                .selection_meta
                .iter()
                .map(|(k, v)| (k.clone(), v.filter_since(sv)))
                .collect(),
            selection_notes: self.selection_notes.filter_since(sv),
            transcriptions: self.transcriptions.filter_since(sv),
            lists: self
                .lists
                .iter()
                .map(|(k, v)| (k.clone(), v.filter_since(sv)))
                .collect(),
            // uuids/aliases carry no authorship; they travel in full with
            // every delta that touches this item, which is harmless since
            // GrowMap::merge is idempotent.
            uuids: self.uuids.clone(),
            aliases: self.aliases.clone(),
        }
    }

    pub fn observe_into(&self, sv: &mut PushClock) {
        self.metadata.observe_into(sv);
        for m in self.photo_metadata.values() {
            m.observe_into(sv);
        }
        for t in self.tags.values() {
            t.observe_into(sv);
        }
        self.notes.observe_into(sv);
        self.selections.observe_into(sv);
        for m in self.selection_meta.values() {
            m.observe_into(sv);
        }
        self.selection_notes.observe_into(sv);
        self.transcriptions.observe_into(sv);
        for l in self.lists.values() {
            l.observe_into(sv);
        }
    }

    /// I4: orphan `uuids` entries whose referent is no longer live in any
    /// of the entity sub-collections. Returns the purged keys.
    pub fn purge_orphaned_uuids(&mut self) -> Vec<String> {
        let live: std::collections::HashSet<&str> = self
            .notes
            .iter_active()
            .map(|(k, _)| k.as_str())
            .chain(self.selections.iter_active().map(|(k, _)| k.as_str()))
            .chain(self.selection_notes.iter_active().map(|(k, _)| k.as_str()))
            .chain(self.transcriptions.iter_active().map(|(k, _)| k.as_str()))
            .chain(
                self.lists
                    .iter()
                    .filter(|(_, l)| l.is_active())
                    .map(|(k, _)| k.as_str()),
            )
            .collect();
        let mut purged = Vec::new();
        let orphans: Vec<String> = self
            .uuids
            .iter()
            .filter(|(_, crdt_key)| !live.contains(crdt_key.as_str()))
            .map(|(k, _)| k.clone())
            .collect();
        for key in orphans {
            self.uuids.remove(&key);
            purged.push(key);
        }
        purged
    }

    pub fn purge_tombstones(&mut self, now: i64, window_secs: i64) {
        self.metadata.purge_tombstones(now, window_secs);
        for m in self.photo_metadata.values_mut() {
            m.purge_tombstones(now, window_secs);
        }
        self.notes.purge_tombstones(now, window_secs);
        self.selections.purge_tombstones(now, window_secs);
        for m in self.selection_meta.values_mut() {
            m.purge_tombstones(now, window_secs);
        }
        self.selection_notes.purge_tombstones(now, window_secs);
        self.transcriptions.purge_tombstones(now, window_secs);
    }
}

/// One shared replicated document per room (§3.2).
#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct ReplicatedDoc {
    pub schema_version: u32,
    pub annotations: BTreeMap<ItemId, ItemBucket>,
    pub templates: LwwMap<String, TemplateValue>,
    pub list_hierarchy: LwwMap<String, ListNodeValue>,
}

impl ReplicatedDoc {
    pub fn new(schema_version: u32) -> Self {
        Self {
            schema_version,
            ..Default::default()
        }
    }

    /// Buckets are created lazily on first write and never destroyed while
    /// any active entry remains (§3.5).
    pub fn get_or_create_item_bucket(&mut self, id: ItemId) -> &mut ItemBucket {
        self.annotations.entry(id).or_default()
    }

    pub fn item_bucket(&self, id: &ItemId) -> Option<&ItemBucket> {
        self.annotations.get(id)
    }

    /// I5/P1: merging two document states is commutative, associative and
    /// idempotent because every sub-merge (LWW max, OR-set union, GrowMap
    /// min) has that property.
    pub fn merge(&mut self, other: &Self) {
        if other.schema_version > self.schema_version {
            self.schema_version = other.schema_version;
        }
        for (id, bucket) in &other.annotations {
            self.annotations.entry(*id).or_default().merge(bucket);
        }
        self.templates.merge(&other.templates, false);
        self.list_hierarchy.merge(&other.list_hierarchy, false);
    }

    /// §4.C: a state vector describing what this replica has seen.
    pub fn state_vector(&self) -> PushClock {
        let mut sv = PushClock::new();
        for bucket in self.annotations.values() {
            bucket.observe_into(&mut sv);
        }
        self.templates.observe_into(&mut sv);
        self.list_hierarchy.observe_into(&mut sv);
        sv
    }

    /// §4.C: the minimal update needed to bring a peer with state vector
    /// `sv` up to date.
    pub fn delta_since(&self, sv: &PushClock) -> Self {
        Self {
            schema_version: self.schema_version,
            annotations: self
                .annotations
                .iter()
                .map(|(id, bucket)| (*id, bucket.filter_since(sv)))
                .filter(|(_, bucket)| !bucket_is_empty_delta(bucket))
                .collect(),
            templates: self.templates.filter_since(sv),
            list_hierarchy: self.list_hierarchy.filter_since(sv),
        }
    }

    /// §3.2 tombstone GC, invoked by relay compaction (§4.I).
    pub fn purge_tombstones(&mut self, now: i64, window_secs: i64) {
        for bucket in self.annotations.values_mut() {
            bucket.purge_tombstones(now, window_secs);
        }
        self.templates.purge_tombstones(now, window_secs);
        self.list_hierarchy.purge_tombstones(now, window_secs);
    }

    /// §3.5: once every sub-collection of a bucket is empty and its
    /// registries orphaned, the bucket itself may be dropped.
    pub fn prune_empty_buckets(&mut self) {
        self.annotations.retain(|_, bucket| !bucket.is_empty());
    }
}

fn bucket_is_empty_delta(bucket: &ItemBucket) -> bool {
    bucket.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Author;

    fn author(s: &str) -> Author {
        Author::from(s)
    }

    #[test]
    fn metadata_lww_across_two_peers() {
        // S1
        let id = crate::id::compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let mut alice = ReplicatedDoc::new(1);
        alice
            .get_or_create_item_bucket(id)
            .metadata
            .write(
                "dc:title".into(),
                author("alice"),
                PushSeq(1),
                MetadataValue {
                    text: "Foo".into(),
                    kind: "string".into(),
                    lang: None,
                },
            );

        let mut bob = ReplicatedDoc::new(1);
        bob.get_or_create_item_bucket(id).metadata.write(
            "dc:title".into(),
            author("bob"),
            PushSeq(2),
            MetadataValue {
                text: "Bar".into(),
                kind: "string".into(),
                lang: None,
            },
        );

        alice.merge(&bob);
        bob.merge(&alice);
        assert_eq!(
            alice.item_bucket(&id).unwrap().metadata.get(&"dc:title".to_string()).unwrap().value.text,
            "Bar"
        );
        assert_eq!(
            bob.item_bucket(&id).unwrap().metadata.get(&"dc:title".to_string()).unwrap().value.text,
            "Bar"
        );
    }

    #[test]
    fn three_peer_convergence() {
        // S4
        let id = crate::id::compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let mut docs: Vec<ReplicatedDoc> = (0..3).map(|_| ReplicatedDoc::new(1)).collect();
        let names = ["alice", "bob", "carol"];
        for (i, name) in names.iter().enumerate() {
            let bucket = docs[i].get_or_create_item_bucket(id);
            bucket.metadata.write(
                format!("prop:{}", i),
                author(name),
                PushSeq((i + 1) as u64),
                MetadataValue {
                    text: format!("v{}", i),
                    kind: "string".into(),
                    lang: None,
                },
            );
            bucket
                .tags
                .entry(format!("tag{}", i))
                .or_default()
                .add(author(name), PushSeq((i + 1) as u64), TagValue { name: format!("tag{}", i), color: None });
        }

        let merged_all = {
            let mut base = docs[0].clone();
            base.merge(&docs[1]);
            base.merge(&docs[2]);
            base
        };
        for doc in &mut docs {
            doc.merge(&merged_all);
        }
        for doc in &docs {
            let bucket = doc.item_bucket(&id).unwrap();
            assert_eq!(bucket.metadata.iter_active().count(), 3);
            assert_eq!(bucket.tags.values().filter(|t| t.is_active()).count(), 3);
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let id = crate::id::compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let mut doc = ReplicatedDoc::new(1);
        doc.get_or_create_item_bucket(id).metadata.write(
            "dc:title".into(),
            author("alice"),
            PushSeq(1),
            MetadataValue {
                text: "Foo".into(),
                kind: "string".into(),
                lang: None,
            },
        );
        let snapshot = doc.clone();
        doc.merge(&snapshot);
        assert_eq!(
            doc.item_bucket(&id).unwrap().metadata.get(&"dc:title".to_string()).unwrap().value.text,
            "Foo"
        );
    }

    #[test]
    fn delta_since_round_trips() {
        let id = crate::id::compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let mut doc = ReplicatedDoc::new(1);
        doc.get_or_create_item_bucket(id).metadata.write(
            "dc:title".into(),
            author("alice"),
            PushSeq(1),
            MetadataValue {
                text: "Foo".into(),
                kind: "string".into(),
                lang: None,
            },
        );
        let empty_sv = PushClock::new();
        let delta = doc.delta_since(&empty_sv);

        let mut replica = ReplicatedDoc::new(1);
        replica.merge(&delta);
        assert_eq!(
            replica.item_bucket(&id).unwrap().metadata.get(&"dc:title".to_string()).unwrap().value.text,
            "Foo"
        );

        // Re-requesting a delta against the now-fully-seen vector is empty.
        let sv = doc.state_vector();
        let empty_delta = doc.delta_since(&sv);
        assert!(empty_delta.annotations.is_empty());
    }
}
