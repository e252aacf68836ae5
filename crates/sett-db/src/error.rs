//! Error types for the store engine.

use sett_codec::CodecError;
use sett_types::NodeId;

/// Errors returned by [`Db`](crate::Db) operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No live record for the requested key hash.
    #[error("record not found")]
    NotFound,

    /// A record already exists for the key hash.
    #[error("record already exists")]
    AlreadyExists,

    /// The record was invalidated by an administrator.
    #[error("record invalidated: {reason}")]
    Invalidated {
        /// Operator-supplied reason.
        reason: String,
    },

    /// The record is past its expiry time.
    #[error("record expired")]
    Expired,

    /// The request failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// An entry's signature failed verification, or its origin is not in
    /// the cluster roster.
    #[error("log entry signature invalid")]
    SignatureInvalid,

    /// A remote log skipped clock values we have not observed; the caller
    /// must fall back to snapshot catch-up.
    #[error("replication gap for node {node_id}: expected clock {expected}, got {got}")]
    ReplicationGap {
        /// Origin node of the offending entry.
        node_id: NodeId,
        /// The next clock value this node expected.
        expected: u64,
        /// The clock value actually received.
        got: u64,
    },

    /// The on-disk store belongs to a different node identity.
    #[error("data directory belongs to node {found}, configured as {configured}")]
    NodeMismatch {
        /// Identity recorded in the store.
        found: NodeId,
        /// Identity from configuration.
        configured: NodeId,
    },

    /// Stored bytes that should always decode did not.
    #[error("corrupt store data: {0}")]
    Corrupt(String),

    /// Storage engine failure. Fatal: callers stop accepting writes.
    #[error("storage error: {0}")]
    Storage(#[from] fjall::Error),

    /// I/O failure on a snapshot stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot frame serialization failure.
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

impl From<CodecError> for DbError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::SignatureInvalid => Self::SignatureInvalid,
            other => Self::Corrupt(other.to_string()),
        }
    }
}
