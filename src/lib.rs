//! The per-peer synchronization engine for a desktop research-annotation
//! application: reconciles local application state with a replicated
//! annotation document (`troparcel_crdt::ReplicatedDoc`) over a pluggable
//! transport, with a durable vault for per-key dedupe state.
pub mod adapter;
pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod sanitize;
pub mod transport;
pub mod uri;
pub mod vault;

pub use adapter::StoreAdapter;
pub use config::EngineConfig;
pub use engine::{EngineState, EngineStatus, SyncEngine};
pub use error::SyncError;
