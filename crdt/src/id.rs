//! §4.A Identity & Keys.
use std::collections::BTreeSet;
use std::fmt;

use bytecheck::CheckBytes;
use rand::RngCore;
use rkyv::{Archive, Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An opaque SHA-256 checksum of a source photo, as computed by the host
/// application. We never compute this ourselves; it arrives as a hex
/// string from the store adapter.
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
pub struct PhotoChecksum(pub String);

impl From<&str> for PhotoChecksum {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PhotoChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stable content fingerprint for an item, derived from its photo
/// checksum set. 32 lowercase hex characters (the low 16 bytes of the
/// SHA-256 digest over the sorted, colon-joined checksums).
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize,
    Serialize,
)]
#[repr(transparent)]
pub struct ItemId([u8; 16]);

impl ItemId {
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl std::str::FromStr for ItemId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            anyhow::bail!("item identity must be 32 hex chars, got {}", s.len());
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

/// Items with zero checksums are unsyncable: identity is null.
///
/// # Examples
/// ```
/// use troparcel_crdt::id::{compute_item_identity, PhotoChecksum};
///
/// let a = vec![PhotoChecksum::from("bbb"), PhotoChecksum::from("aaa")];
/// let b = vec![PhotoChecksum::from("aaa"), PhotoChecksum::from("bbb")];
/// assert_eq!(compute_item_identity(&a), compute_item_identity(&b)); // P8
/// assert!(compute_item_identity(&[]).is_none());
/// ```
pub fn compute_item_identity(checksums: &[PhotoChecksum]) -> Option<ItemId> {
    if checksums.is_empty() {
        return None;
    }
    let mut sorted: Vec<&str> = checksums.iter().map(|c| c.0.as_str()).collect();
    sorted.sort_unstable();
    let joined = sorted.join(":");
    let digest = Sha256::digest(joined.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[0..16]);
    Some(ItemId(out))
}

/// Jaccard similarity of two checksum sets: `|A ∩ B| / |A ∪ B|`.
pub fn jaccard_similarity(a: &BTreeSet<PhotoChecksum>, b: &BTreeSet<PhotoChecksum>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Minimum Jaccard similarity for a fuzzy identity match (Q3/I known attack
/// surface: at exactly this threshold an attacker can target a two-photo
/// item by sharing a single checksum; documented, not mitigated).
pub const FUZZY_MATCH_THRESHOLD: f64 = 0.5;

/// Finds the best local candidate for a remote checksum set among
/// `locals`, if any clears [`FUZZY_MATCH_THRESHOLD`]. Ties are broken by
/// the caller's iteration order (first max wins).
pub fn fuzzy_match<'a, T>(
    remote: &BTreeSet<PhotoChecksum>,
    locals: impl Iterator<Item = (T, &'a BTreeSet<PhotoChecksum>)>,
) -> Option<T> {
    let mut best: Option<(T, f64)> = None;
    for (candidate, checksums) in locals {
        let score = jaccard_similarity(remote, checksums);
        if score >= FUZZY_MATCH_THRESHOLD {
            match &best {
                Some((_, best_score)) if *best_score >= score => {}
                _ => best = Some((candidate, score)),
            }
        }
    }
    best.map(|(c, _)| c)
}

/// A fingerprint over a selection's photo and rounded bounding box,
/// used only to dedupe applies, never as a CRDT key. Rounding to integers
/// is intentional: collisions within one pixel are by design.
pub fn compute_selection_fingerprint(photo: &PhotoChecksum, x: f64, y: f64, w: f64, h: f64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(photo.0.as_bytes());
    for v in [x, y, w, h] {
        hasher.update(&(v.round() as i64).to_le_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn new_opaque_key(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, hex::encode(bytes))
}

pub fn new_note_key() -> String {
    new_opaque_key("n_")
}

pub fn new_selection_key() -> String {
    new_opaque_key("s_")
}

pub fn new_transcription_key() -> String {
    new_opaque_key("t_")
}

pub fn new_list_key() -> String {
    new_opaque_key("l_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_opaque_and_long_enough() {
        for key in [new_note_key(), new_selection_key(), new_transcription_key(), new_list_key()] {
            assert!(key.len() >= 10);
        }
        assert_ne!(new_note_key(), new_note_key());
    }

    #[test]
    fn fuzzy_match_at_exactly_half_jaccard() {
        // S5: local {A, B}, remote {A}. Jaccard = 1/2.
        let mut local: BTreeSet<PhotoChecksum> = BTreeSet::new();
        local.insert("A".into());
        local.insert("B".into());
        let mut remote: BTreeSet<PhotoChecksum> = BTreeSet::new();
        remote.insert("A".into());

        let candidates = vec![("item-1", &local)];
        let matched = fuzzy_match(&remote, candidates.into_iter());
        assert_eq!(matched, Some("item-1"));
    }

    #[test]
    fn below_threshold_does_not_match() {
        let mut local: BTreeSet<PhotoChecksum> = BTreeSet::new();
        local.insert("A".into());
        local.insert("B".into());
        local.insert("C".into());
        let mut remote: BTreeSet<PhotoChecksum> = BTreeSet::new();
        remote.insert("A".into());

        let candidates = vec![("item-1", &local)];
        assert_eq!(fuzzy_match(&remote, candidates.into_iter()), None);
    }
}
