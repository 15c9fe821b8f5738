//! §4.C wire encoding: state vectors and deltas are rkyv-encoded byte
//! buffers, validated with `bytecheck` before any field is touched.
use bytecheck::CheckBytes;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::{Archive, Deserialize, Infallible, Serialize};

use crate::doc::ReplicatedDoc;
use crate::error::CrdtError;

const SCRATCH: usize = 4096;

fn encode<T>(value: &T) -> Result<Vec<u8>, CrdtError>
where
    T: Serialize<AllocSerializer<SCRATCH>>,
{
    let mut serializer = AllocSerializer::<SCRATCH>::default();
    serializer
        .serialize_value(value)
        .map_err(|e| CrdtError::Encode(e.to_string()))?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn decode<T>(bytes: &[u8]) -> Result<T, CrdtError>
where
    T: Archive,
    T::Archived: Deserialize<T, Infallible> + for<'a> CheckBytes<rkyv::validation::validators::DefaultValidator<'a>>,
{
    let archived = rkyv::check_archived_root::<T>(bytes)
        .map_err(|e| CrdtError::Decode(e.to_string()))?;
    archived
        .deserialize(&mut Infallible)
        .map_err(|_| CrdtError::Decode("infallible deserialize failed".into()))
}

/// Encodes the full document state, e.g. for the relay's durable snapshot
/// or a fresh peer's initial sync.
pub fn encode_state(doc: &ReplicatedDoc) -> Result<Vec<u8>, CrdtError> {
    encode(doc)
}

pub fn decode_state(bytes: &[u8]) -> Result<ReplicatedDoc, CrdtError> {
    decode(bytes)
}

/// §4.C `encodeDelta(stateVector)`: encodes only what the peer described by
/// `sv` hasn't seen yet.
pub fn encode_delta(doc: &ReplicatedDoc, sv: &[u8]) -> Result<Vec<u8>, CrdtError> {
    let peer_sv = if sv.is_empty() {
        crate::clock::PushClock::new()
    } else {
        decode_push_clock(sv)?
    };
    let delta = doc.delta_since(&peer_sv);
    encode(&delta)
}

pub fn decode_delta(bytes: &[u8]) -> Result<ReplicatedDoc, CrdtError> {
    decode(bytes)
}

/// The on-wire form of a `PushClock`: a flat sorted `(author, pushSeq)`
/// list, rkyv-encoded like everything else.
#[derive(Clone, Debug, Default, Archive, Serialize, Deserialize)]
#[archive_attr(derive(CheckBytes))]
struct WireClock {
    entries: Vec<(String, u64)>,
}

pub fn encode_state_vector(sv: &crate::clock::PushClock) -> Result<Vec<u8>, CrdtError> {
    let entries = sv
        .iter()
        .map(|(author, seq)| (author.0.clone(), seq.0))
        .collect();
    encode(&WireClock { entries })
}

pub fn decode_push_clock(bytes: &[u8]) -> Result<crate::clock::PushClock, CrdtError> {
    let wire: WireClock = decode(bytes)?;
    let mut sv = crate::clock::PushClock::new();
    for (author, seq) in wire.entries {
        sv.observe(
            &crate::clock::Author(author),
            crate::clock::PushSeq(seq),
        );
    }
    Ok(sv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Author, PushSeq};
    use crate::doc::MetadataValue;
    use crate::id::{compute_item_identity, PhotoChecksum};

    #[test]
    fn state_round_trips() {
        let id = compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let mut doc = ReplicatedDoc::new(1);
        doc.get_or_create_item_bucket(id).metadata.write(
            "dc:title".into(),
            Author::from("alice"),
            PushSeq(1),
            MetadataValue {
                text: "Foo".into(),
                kind: "string".into(),
                lang: None,
            },
        );
        let bytes = encode_state(&doc).unwrap();
        let decoded = decode_state(&bytes).unwrap();
        assert_eq!(
            decoded
                .item_bucket(&id)
                .unwrap()
                .metadata
                .get(&"dc:title".to_string())
                .unwrap()
                .value
                .text,
            "Foo"
        );
    }

    #[test]
    fn state_vector_round_trips() {
        let mut sv = crate::clock::PushClock::new();
        sv.observe(&Author::from("alice"), PushSeq(3));
        let bytes = encode_state_vector(&sv).unwrap();
        let decoded = decode_push_clock(&bytes).unwrap();
        assert_eq!(decoded.get(&Author::from("alice")), PushSeq(3));
    }

    #[test]
    fn delta_against_empty_vector_is_full_state() {
        let id = compute_item_identity(&[PhotoChecksum::from("a")]).unwrap();
        let mut doc = ReplicatedDoc::new(1);
        doc.get_or_create_item_bucket(id).metadata.write(
            "dc:title".into(),
            Author::from("alice"),
            PushSeq(1),
            MetadataValue {
                text: "Foo".into(),
                kind: "string".into(),
                lang: None,
            },
        );
        let bytes = encode_delta(&doc, &[]).unwrap();
        let delta = decode_delta(&bytes).unwrap();
        assert!(delta.item_bucket(&id).is_some());
    }

    #[test]
    fn corrupt_bytes_are_rejected_not_trusted() {
        let garbage = vec![0xffu8; 32];
        assert!(decode_state(&garbage).is_err());
    }
}
