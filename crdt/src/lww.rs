//! Per-field last-write-wins register, used for `metadata`, `photoMetadata`,
//! `notes`, `selections`, `selectionMeta`, `selectionNotes` and
//! `transcriptions` (§3.2, §3.3).
use std::collections::BTreeMap;

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

use crate::clock::{is_newer, Author, PushClock, PushSeq};

/// A single versioned value. Every active entry satisfies I1 (`author` is
/// never empty, `pushSeq` is always finite) by construction.
#[derive(Clone, Debug, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct Entry<V> {
    pub author: Author,
    pub push_seq: PushSeq,
    pub deleted: bool,
    pub deleted_at: Option<i64>,
    pub value: V,
}

impl<V> Entry<V> {
    pub fn new(author: Author, push_seq: PushSeq, value: V) -> Self {
        Self {
            author,
            push_seq,
            deleted: false,
            deleted_at: None,
            value,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Deterministic tiebreak: the entry with the higher `(pushSeq, author)`
    /// pair wins, never wall-clock time (DESIGN NOTES).
    pub fn is_newer_than(&self, other: &Entry<V>) -> bool {
        is_newer(&self.author, self.push_seq, &other.author, other.push_seq)
    }
}

/// A map of LWW registers keyed by field/entity key.
///
/// Joining two `LwwMap`s is commutative, associative and idempotent: for
/// each key we simply keep whichever entry compares greater under
/// [`Entry::is_newer_than`], which is a total order over distinct
/// `(pushSeq, author)` pairs (I5, P1).
#[derive(Clone, Debug, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct LwwMap<K, V> {
    entries: BTreeMap<K, Entry<V>>,
}

impl<K, V> Default for LwwMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> LwwMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &K) -> Option<&Entry<V>> {
        self.entries.get(key)
    }

    /// Writes `value` for `key` iff it is newer than the current entry (or
    /// there is none). Returns `true` if the write took effect.
    pub fn write(&mut self, key: K, author: Author, push_seq: PushSeq, value: V) -> bool {
        let incoming = Entry::new(author, push_seq, value);
        self.insert_entry(key, incoming)
    }

    pub fn tombstone(&mut self, key: K, author: Author, push_seq: PushSeq, deleted_at: i64)
    where
        V: Default,
    {
        let mut incoming = Entry::new(author, push_seq, V::default());
        incoming.deleted = true;
        incoming.deleted_at = Some(deleted_at);
        // A tombstone write must still carry the field's current value when
        // one exists, so readers that only ever see the winning entry don't
        // lose the payload if a later write loses the tiebreak back to it.
        if let Some(existing) = self.entries.get(&key) {
            if !incoming.is_newer_than(existing) {
                return;
            }
            incoming.value = existing.value.clone();
        }
        self.entries.insert(key, incoming);
    }

    fn insert_entry(&mut self, key: K, incoming: Entry<V>) -> bool {
        match self.entries.get(&key) {
            Some(existing) if !incoming.is_newer_than(existing) => false,
            _ => {
                self.entries.insert(key, incoming);
                true
            }
        }
    }

    /// Active (non-tombstoned) entries only (I3).
    pub fn iter_active(&self) -> impl Iterator<Item = (&K, &Entry<V>)> {
        self.entries.iter().filter(|(_, e)| e.is_active())
    }

    pub fn iter_all(&self) -> impl Iterator<Item = (&K, &Entry<V>)> {
        self.entries.iter()
    }

    /// Merges `other` into `self`. `authored_guard` implements §3.3's
    /// ownership guard: an incoming tombstone on an authored entity (note,
    /// selection, transcription) that doesn't match the existing entry's
    /// author is dropped rather than merged in.
    pub fn merge(&mut self, other: &Self, authored_guard: bool) {
        for (key, incoming) in &other.entries {
            if authored_guard && incoming.deleted {
                if let Some(existing) = self.entries.get(key) {
                    if existing.author != incoming.author {
                        continue;
                    }
                }
            }
            self.insert_entry(key.clone(), incoming.clone());
        }
    }

    /// Drops tombstones older than `window_secs` relative to `now` (§3.2
    /// "Tombstones are time-garbage-collected").
    pub fn purge_tombstones(&mut self, now: i64, window_secs: i64) {
        self.entries.retain(|_, e| {
            !(e.deleted && e.deleted_at.map(|at| now - at >= window_secs).unwrap_or(false))
        });
    }

    /// The subset of entries strictly newer than `sv` records for their
    /// author (§4.C `encodeDelta`).
    pub fn filter_since(&self, sv: &PushClock) -> Self {
        let mut out = Self::new();
        for (key, entry) in &self.entries {
            if entry.push_seq > sv.get(&entry.author) {
                out.entries.insert(key.clone(), entry.clone());
            }
        }
        out
    }

    pub fn observe_into(&self, sv: &mut PushClock) {
        for entry in self.entries.values() {
            sv.observe(&entry.author, entry.push_seq);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(s: &str) -> Author {
        Author::from(s)
    }

    #[test]
    fn higher_push_seq_wins() {
        let mut m: LwwMap<String, String> = LwwMap::new();
        m.write("title".into(), author("alice"), PushSeq(1), "Foo".into());
        m.write("title".into(), author("bob"), PushSeq(2), "Bar".into());
        assert_eq!(m.get(&"title".to_string()).unwrap().value, "Bar");
    }

    #[test]
    fn stale_write_is_ignored() {
        let mut m: LwwMap<String, String> = LwwMap::new();
        m.write("title".into(), author("bob"), PushSeq(2), "Bar".into());
        m.write("title".into(), author("alice"), PushSeq(1), "Foo".into());
        assert_eq!(m.get(&"title".to_string()).unwrap().value, "Bar");
    }

    #[test]
    fn merge_is_commutative() {
        let mut a: LwwMap<String, String> = LwwMap::new();
        a.write("k".into(), author("alice"), PushSeq(1), "a".into());
        let mut b: LwwMap<String, String> = LwwMap::new();
        b.write("k".into(), author("bob"), PushSeq(2), "b".into());

        let mut ab = a.clone();
        ab.merge(&b, false);
        let mut ba = b.clone();
        ba.merge(&a, false);
        assert_eq!(ab.get(&"k".to_string()).unwrap().value, ba.get(&"k".to_string()).unwrap().value);
    }

    #[test]
    fn authored_guard_rejects_mismatched_tombstone() {
        let mut doc: LwwMap<String, String> = LwwMap::new();
        doc.write("n_abc".into(), author("alice"), PushSeq(1), "<p>x</p>".into());

        let mut incoming: LwwMap<String, String> = LwwMap::new();
        incoming.tombstone("n_abc".into(), author("bob"), PushSeq(2), 1000);

        doc.merge(&incoming, true);
        let entry = doc.get(&"n_abc".to_string()).unwrap();
        assert!(entry.is_active(), "mismatched-author tombstone must not apply");
    }
}
