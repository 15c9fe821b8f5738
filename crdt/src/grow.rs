//! Advisory, effectively-append-only maps for `uuids` and `aliases`
//! (§3.2). Neither sub-collection has documented conflict semantics in the
//! spec; both are write-once in normal operation (a `uuids` entry is
//! created once by whichever peer first pushes the entity, an `aliases`
//! entry once per re-import), so concurrent writes to the same key are an
//! anomaly rather than the common case. We resolve them deterministically
//! by keeping the smaller value under `Ord`, which makes the join a
//! min-semilattice: commutative, associative and idempotent regardless of
//! which replica saw which write first.
use std::collections::BTreeMap;

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
pub struct GrowMap<K, V> {
    entries: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Ord + Clone> GrowMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts `value` for `key` if absent. Returns `true` if this call
    /// created the entry.
    pub fn insert_if_absent(&mut self, key: K, value: V) -> bool {
        if self.entries.contains_key(&key) {
            false
        } else {
            self.entries.insert(key, value);
            true
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.entries {
            match self.entries.get(key) {
                Some(existing) if existing <= value => {}
                _ => {
                    self.entries.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let mut a: GrowMap<String, String> = GrowMap::new();
        a.insert_if_absent("k1".into(), "v1".into());
        let mut b: GrowMap<String, String> = GrowMap::new();
        b.insert_if_absent("k1".into(), "v0".into());
        b.insert_if_absent("k2".into(), "v2".into());

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab.get(&"k1".to_string()), ba.get(&"k1".to_string()));
        assert_eq!(ab.get(&"k2".to_string()), ba.get(&"k2".to_string()));

        let mut ab2 = ab.clone();
        ab2.merge(&b);
        assert_eq!(ab2.get(&"k1".to_string()), ab.get(&"k1".to_string()));
    }
}
