//! Pull-based peer-to-peer replication.
//!
//! Each node runs one [`Replicator`] per configured peer. A replicator
//! tails the peer's log from the local high-water mark on a jittered
//! interval, applies each entry through the engine's merge rules, and
//! falls back to snapshot catch-up when the peer has trimmed past the
//! mark. The serving side is [`ReplicationService`], which answers pull
//! and snapshot requests from the local engine.
//!
//! Because `apply` is idempotent and keyed by `(node_id, clock)`, the
//! replication graph may contain cycles without duplicating state.

mod replicator;
mod service;


pub use replicator::{PeerHandle, Replicator, ReplicatorConfig};
pub use service::ReplicationService;

use sett_db::DbError;
use sett_net::NetError;

/// Errors surfaced by a replication worker.
#[derive(Debug, thiserror::Error)]
pub enum ReplError {
    /// Transport failure; retried with backoff by the owning worker.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Engine failure while applying entries.
    #[error("db error: {0}")]
    Db(#[from] DbError),

    /// A pulled entry did not decode.
    #[error("entry decode error: {0}")]
    Codec(#[from] sett_codec::CodecError),
}

impl ReplError {
    /// Whether the owning worker should retry with backoff (true) or
    /// abort its loop (false — storage is failing underneath us).
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Db(DbError::Storage(_)) | Self::Db(DbError::Io(_)))
    }
}
