//! Per-author push-sequence bookkeeping.
//!
//! `pushSeq` is the ordering primitive for this CRDT: it is never derived
//! from wall-clock time, only from each author's own monotonic counter.
//! A [`PushClock`] tracks, for a set of authors, the highest `pushSeq`
//! this replica has observed from each of them. It doubles as the "state
//! vector" of §4.C: `encodeDelta(stateVector)` is implemented in
//! `crate::encode` by filtering every CRDT entry against exactly this
//! structure.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// A stable per-peer author identifier (the host application's user id).
#[derive(
    Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes, Deserialize, Serialize,
)]
#[archive_attr(derive(Debug, Eq, Hash, Ord, PartialEq, PartialOrd))]
pub struct Author(pub String);

impl fmt::Display for Author {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Author {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Author {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A per-author monotonic counter. Never compared against wall-clock time.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Archive, CheckBytes,
    Deserialize, Serialize,
)]
#[archive_attr(derive(Debug, Eq, Hash, Ord, PartialEq, PartialOrd))]
#[repr(transparent)]
pub struct PushSeq(pub u64);

impl PushSeq {
    pub const ZERO: PushSeq = PushSeq(0);

    pub fn next(self) -> Self {
        PushSeq(self.0 + 1)
    }
}

impl fmt::Display for PushSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The deterministic tiebreak order used everywhere two writes to the same
/// field are compared: highest `pushSeq` wins, ties broken by author.
pub fn order_key(author: &Author, push_seq: PushSeq) -> (u64, &str) {
    (push_seq.0, author.0.as_str())
}

pub fn is_newer(a_author: &Author, a_seq: PushSeq, b_author: &Author, b_seq: PushSeq) -> bool {
    order_key(a_author, a_seq) > order_key(b_author, b_seq)
}

/// Tracks, per author, the highest `pushSeq` this replica has observed.
///
/// # Examples
/// ```
/// use troparcel_crdt::clock::{Author, PushClock, PushSeq};
///
/// let mut sv = PushClock::new();
/// sv.observe(&Author::from("alice"), PushSeq(2));
/// sv.observe(&Author::from("alice"), PushSeq(1)); // no-op, not newer
/// assert_eq!(sv.get(&Author::from("alice")), PushSeq(2));
/// assert_eq!(sv.get(&Author::from("bob")), PushSeq::ZERO);
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PushClock {
    seen: BTreeMap<Author, PushSeq>,
}

impl PushClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest `pushSeq` observed for `author`; unseen authors read as zero.
    pub fn get(&self, author: &Author) -> PushSeq {
        self.seen.get(author).copied().unwrap_or(PushSeq::ZERO)
    }

    /// Monotonically raises the recorded high-water mark for `author`.
    pub fn observe(&mut self, author: &Author, push_seq: PushSeq) {
        match self.seen.get(author) {
            Some(cur) if *cur >= push_seq => {}
            _ => {
                self.seen.insert(author.clone(), push_seq);
            }
        }
    }

    /// `true` iff `push_seq` has already been observed for `author`.
    pub fn has_seen(&self, author: &Author, push_seq: PushSeq) -> bool {
        self.get(author) >= push_seq
    }

    /// Union of two state vectors: the per-author maximum of both.
    pub fn union(&mut self, other: &PushClock) {
        for (author, seq) in &other.seen {
            self.observe(author, *seq);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Author, PushSeq)> {
        self.seen.iter().map(|(a, s)| (a, *s))
    }
}

impl PartialOrd for PushClock {
    fn partial_cmp(&self, other: &PushClock) -> Option<Ordering> {
        if self == other {
            Some(Ordering::Equal)
        } else if other
            .seen
            .iter()
            .all(|(author, seq)| self.get(author) >= *seq)
        {
            Some(Ordering::Greater)
        } else if self
            .seen
            .iter()
            .all(|(author, seq)| other.get(author) >= *seq)
        {
            Some(Ordering::Less)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_is_monotonic_per_author() {
        let mut sv = PushClock::new();
        let alice = Author::from("alice");
        sv.observe(&alice, PushSeq(5));
        sv.observe(&alice, PushSeq(3));
        assert_eq!(sv.get(&alice), PushSeq(5));
    }

    #[test]
    fn union_is_commutative() {
        let mut a = PushClock::new();
        a.observe(&Author::from("alice"), PushSeq(2));
        let mut b = PushClock::new();
        b.observe(&Author::from("bob"), PushSeq(7));

        let mut ab = a.clone();
        ab.union(&b);
        let mut ba = b.clone();
        ba.union(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn order_key_tiebreaks_on_author() {
        let a = Author::from("alice");
        let b = Author::from("bob");
        assert!(is_newer(&b, PushSeq(1), &a, PushSeq(1)));
        assert!(is_newer(&a, PushSeq(2), &b, PushSeq(1)));
    }
}
