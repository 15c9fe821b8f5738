//! Add-wins observed-remove set, used for `tags` and `lists` (§3.2, §3.3).
//!
//! Each add creates a fresh tag `(author, pushSeq)`; a remove tombstones
//! the specific tags it observed as active. Because `pushSeq` is strictly
//! monotonic per author (I2), tags are globally unique, so a re-add after a
//! remove always mints an untombstoned tag and the entry reactivates
//! (S2). The join is a plain set union of adds and tombstones, which is
//! trivially commutative, associative and idempotent (I5, P1).
use std::collections::BTreeSet;

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

use crate::clock::{Author, PushClock, PushSeq};

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize)]
#[archive_attr(derive(Eq, Hash, Ord, PartialEq, PartialOrd))]
pub struct Tag {
    pub author: Author,
    pub push_seq: PushSeq,
}

#[derive(Clone, Debug, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct OrSet<V> {
    adds: Vec<(Tag, V)>,
    tombstones: BTreeSet<Tag>,
}

impl<V> Default for OrSet<V> {
    fn default() -> Self {
        Self {
            adds: Vec::new(),
            tombstones: BTreeSet::new(),
        }
    }
}

impl<V: Clone> OrSet<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, author: Author, push_seq: PushSeq, value: V) {
        let tag = Tag { author, push_seq };
        if !self.adds.iter().any(|(t, _)| t == &tag) {
            self.adds.push((tag, value));
        }
    }

    /// Tombstones every tag currently active. This is the observed-remove
    /// step: the remover always targets the adds it can currently see.
    pub fn remove_all_active(&mut self) {
        for (tag, _) in &self.adds {
            self.tombstones.insert(tag.clone());
        }
    }

    pub fn active_tags(&self) -> impl Iterator<Item = &Tag> {
        self.adds
            .iter()
            .map(|(t, _)| t)
            .filter(move |t| !self.tombstones.contains(t))
    }

    pub fn is_active(&self) -> bool {
        self.active_tags().next().is_some()
    }

    /// The value written by the most recent still-active add.
    pub fn value(&self) -> Option<&V> {
        self.adds
            .iter()
            .filter(|(t, _)| !self.tombstones.contains(t))
            .max_by(|(a, _), (b, _)| (a.push_seq, &a.author).cmp(&(b.push_seq, &b.author)))
            .map(|(_, v)| v)
    }

    pub fn merge(&mut self, other: &Self) {
        for (tag, value) in &other.adds {
            if !self.adds.iter().any(|(t, _)| t == tag) {
                self.adds.push((tag.clone(), value.clone()));
            }
        }
        for tag in &other.tombstones {
            self.tombstones.insert(tag.clone());
        }
    }

    pub fn filter_since(&self, sv: &PushClock) -> Self {
        let adds = self
            .adds
            .iter()
            .filter(|(t, _)| t.push_seq > sv.get(&t.author))
            .cloned()
            .collect();
        let tombstones = self
            .tombstones
            .iter()
            .filter(|t| t.push_seq > sv.get(&t.author))
            .cloned()
            .collect();
        Self { adds, tombstones }
    }

    pub fn observe_into(&self, sv: &mut PushClock) {
        for (tag, _) in &self.adds {
            sv.observe(&tag.author, tag.push_seq);
        }
        for tag in &self.tombstones {
            sv.observe(&tag.author, tag.push_seq);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.adds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(s: &str) -> Author {
        Author::from(s)
    }

    #[test]
    fn add_wins_over_concurrent_remove_then_readd() {
        // S2: Alice adds (1), Bob tombstones (2), Alice re-adds (3).
        let mut set: OrSet<()> = OrSet::new();
        set.add(author("alice"), PushSeq(1), ());

        let mut bobs_view = set.clone();
        bobs_view.remove_all_active();

        set.merge(&bobs_view);
        assert!(!set.is_active(), "tombstoned by bob");

        set.add(author("alice"), PushSeq(3), ());
        assert!(set.is_active(), "re-add must win");
    }

    #[test]
    fn merge_is_commutative() {
        let mut a: OrSet<u32> = OrSet::new();
        a.add(author("alice"), PushSeq(1), 1);
        let mut b: OrSet<u32> = OrSet::new();
        b.add(author("bob"), PushSeq(1), 2);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.adds.len(), ba.adds.len());
        assert_eq!(ab.active_tags().count(), ba.active_tags().count());
    }
}
