use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("failed to encode crdt state: {0}")]
    Encode(String),

    #[error("failed to decode crdt state: {0}")]
    Decode(String),

    #[error("item identity is null (no checksums)")]
    NullIdentity,
}
