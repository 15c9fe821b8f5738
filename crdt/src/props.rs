//! Property-based tests for the convergence invariants (P1, P3, I5).
use proptest::prelude::*;

use crate::clock::{Author, PushSeq};
use crate::doc::{MetadataValue, ReplicatedDoc, TagValue};
use crate::id::{compute_item_identity, PhotoChecksum};

fn author_strategy() -> impl Strategy<Value = Author> {
    prop_oneof!["alice", "bob", "carol"].prop_map(Author::from)
}

fn op_strategy() -> impl Strategy<Value = (Author, u64, String, String)> {
    (
        author_strategy(),
        1u64..20,
        prop_oneof!["dc:title", "dc:description", "dc:creator"].prop_map(|s| s.to_string()),
        "[a-z]{1,8}",
    )
}

fn apply_ops(ops: &[(Author, u64, String, String)]) -> ReplicatedDoc {
    let id = compute_item_identity(&[PhotoChecksum::from("fixed")]).unwrap();
    let mut doc = ReplicatedDoc::new(1);
    for (author, seq, prop, text) in ops {
        doc.get_or_create_item_bucket(id).metadata.write(
            prop.clone(),
            author.clone(),
            PushSeq(*seq),
            MetadataValue {
                text: text.clone(),
                kind: "string".into(),
                lang: None,
            },
        );
    }
    doc
}

proptest! {
    /// P1: merging two states derived from the same op set in either order
    /// converges to the same result, regardless of split point.
    #[test]
    fn merge_converges_regardless_of_split(
        ops in prop::collection::vec(op_strategy(), 1..12),
        split in 0usize..12,
    ) {
        let split = split.min(ops.len());
        let (left, right) = ops.split_at(split);

        let mut a = apply_ops(left);
        let b = apply_ops(right);
        a.merge(&b);

        let mut reassembled = apply_ops(&ops);
        // Applying left then right directly must match merging two partial
        // replicas, since LWW resolution only depends on (pushSeq, author).
        let mut from_halves = apply_ops(left);
        from_halves.merge(&apply_ops(right));

        let id = compute_item_identity(&[PhotoChecksum::from("fixed")]).unwrap();
        for prop in ["dc:title", "dc:description", "dc:creator"] {
            let expected = reassembled.item_bucket(&id).and_then(|b| b.metadata.get(&prop.to_string())).map(|e| e.value.text.clone());
            let got = from_halves.item_bucket(&id).and_then(|b| b.metadata.get(&prop.to_string())).map(|e| e.value.text.clone());
            prop_assert_eq!(expected, got);
        }
        let _ = a;
    }

    /// P1/I5: merge is idempotent no matter how many times it's repeated.
    #[test]
    fn merge_is_idempotent(ops in prop::collection::vec(op_strategy(), 0..10)) {
        let mut doc = apply_ops(&ops);
        let snapshot = doc.clone();
        doc.merge(&snapshot);
        doc.merge(&snapshot);

        let id = compute_item_identity(&[PhotoChecksum::from("fixed")]).unwrap();
        prop_assert_eq!(
            doc.item_bucket(&id).map(|b| b.metadata.iter_active().count()),
            snapshot.item_bucket(&id).map(|b| b.metadata.iter_active().count())
        );
    }

    /// P1: merge is commutative for arbitrary op partitions.
    #[test]
    fn merge_is_commutative(
        ops_a in prop::collection::vec(op_strategy(), 0..8),
        ops_b in prop::collection::vec(op_strategy(), 0..8),
    ) {
        let mut ab = apply_ops(&ops_a);
        ab.merge(&apply_ops(&ops_b));
        let mut ba = apply_ops(&ops_b);
        ba.merge(&apply_ops(&ops_a));

        let id = compute_item_identity(&[PhotoChecksum::from("fixed")]).unwrap();
        for prop in ["dc:title", "dc:description", "dc:creator"] {
            let left = ab.item_bucket(&id).and_then(|b| b.metadata.get(&prop.to_string())).map(|e| e.value.text.clone());
            let right = ba.item_bucket(&id).and_then(|b| b.metadata.get(&prop.to_string())).map(|e| e.value.text.clone());
            prop_assert_eq!(left, right);
        }
    }

    /// S2 generalized: any interleaving of add/remove on a tag OR-set that
    /// ends with an add strictly newer than every remove leaves it active.
    #[test]
    fn orset_add_wins_for_any_ordering(
        remove_seq in 1u64..10,
        readd_seq in 1u64..10,
    ) {
        let mut set: crate::orset::OrSet<TagValue> = crate::orset::OrSet::new();
        set.add(Author::from("alice"), PushSeq(0), TagValue { name: "t".into(), color: None });

        let mut remover = set.clone();
        remover.remove_all_active();
        set.merge(&remover);

        if readd_seq > remove_seq {
            set.add(Author::from("alice"), PushSeq(readd_seq), TagValue { name: "t".into(), color: None });
            prop_assert!(set.is_active());
        }
    }
}
