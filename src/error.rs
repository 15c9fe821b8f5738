use thiserror::Error;

/// Error kinds surfaced across the engine boundary (§7). These are the
/// *semantic* kinds the spec distinguishes; module internals use
/// `anyhow::Error` freely and convert at the edge.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("vault io error: {0}")]
    VaultIo(#[source] std::io::Error),

    #[error("invalid connection string: {0}")]
    InvalidUri(String),

    #[error("lock acquisition failed")]
    LockFailed,

    #[error("engine is stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, SyncError>;
