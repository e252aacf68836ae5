//! Embedded replicated credential store engine.
//!
//! This crate is the heart of sett: an append-only, multi-node key/value
//! store that maps a [`KeyHash`](sett_types::KeyHash) to an encrypted
//! [`Record`](sett_types::Record). Every mutation appends a signed
//! [`LogEntry`](sett_codec::LogEntry); replication pulls remote logs and
//! merges them under deterministic rules, so the cluster converges without
//! coordination.
//!
//! Layout:
//!
//! - [`store`] — the storage backend (fjall keyspaces on disk, or pure
//!   in-memory for tests), with atomic multi-keyspace batches.
//! - [`clock`] — the per-node monotonic counter persisted with every write.
//! - [`merge`] — the conflict resolution lattice.
//! - [`db`] — [`Db`], tying it all together: append/apply/range, the
//!   resolver and admin operations, TTL GC, log retention, and snapshots.

mod clock;
mod db;
mod error;
mod merge;
mod store;

#[cfg(test)]
mod tests;

pub use clock::Clock;
pub use db::{Db, DbOptions, GcStats, SnapshotFrame};
pub use error::DbError;
pub use merge::join_records;
pub use store::Space;

use sett_types::{KeyHash, Record};

/// The capability set a credential backend exposes to the front-end.
///
/// Implemented by [`Db`]; alternative backends (in-memory, SQL) satisfy the
/// same contract so the front-end stays backend-agnostic.
pub trait CredentialStore: Send + Sync {
    /// Store a new record under a key hash.
    fn put_record(&self, key_hash: KeyHash, record: Record) -> Result<(), DbError>;

    /// Resolve the live record for a key hash.
    fn get_record(&self, key_hash: KeyHash) -> Result<Record, DbError>;

    /// Tombstone the record for a key hash.
    fn delete_record(&self, key_hash: KeyHash) -> Result<(), DbError>;

    /// Bring persistent state up to the latest schema. Backends without
    /// migrations accept the default no-op.
    fn migrate_to_latest(&self) -> Result<(), DbError> {
        Ok(())
    }
}
