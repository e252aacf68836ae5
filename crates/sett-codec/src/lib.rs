//! Binary record envelope and signed log entry codec.
//!
//! The on-disk and on-wire form of a [`Record`](sett_types::Record) and a
//! [`LogEntry`] is a field-tagged, length-prefixed binary envelope whose
//! byte layout is fixed for all time. Schema evolution adds new tags;
//! existing tags are never reordered or reused, and decoders skip tags they
//! do not know.
//!
//! Entries are signed with ed25519 over their canonical serialization
//! (every field except the signature itself, tags ascending), so any node
//! holding the cluster roster can verify authorship of a replicated entry.

mod entry;
mod error;
mod record;
mod roster;
mod wire;

pub use entry::{LogEntry, Operation, canonical_for_signing, decode_entry, encode_entry};
pub use error::CodecError;
pub use record::{decode_record, encode_record};
pub use roster::Roster;
