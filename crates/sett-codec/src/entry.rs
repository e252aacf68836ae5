//! Signed log entries — the unit of replication.
//!
//! Envelope tags (permanent):
//!
//! | tag | field     | payload                          |
//! |-----|-----------|----------------------------------|
//! | 1   | node_id   | 16 bytes                         |
//! | 2   | clock     | unsigned varint                  |
//! | 3   | key_hash  | 32 bytes                         |
//! | 4   | operation | 1 byte code                      |
//! | 5   | delta     | nested envelope (per operation)  |
//! | 6   | signature | 64 bytes                         |
//!
//! The canonical form for signing is the envelope with tags 1–5 only, in
//! ascending order. Replication carries the full encoded bytes, so the
//! receiver verifies the exact bytes the origin signed.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sett_types::{KeyHash, NodeId, Record};

use crate::error::CodecError;
use crate::record::{decode_record, encode_record};
use crate::wire::{
    FieldReader, field_array, field_ivarint, field_string, field_uvarint, put_field,
    put_ivarint_field, put_uvarint_field,
};

const TAG_NODE_ID: u64 = 1;
const TAG_CLOCK: u64 = 2;
const TAG_KEY_HASH: u64 = 3;
const TAG_OPERATION: u64 = 4;
const TAG_DELTA: u64 = 5;
const TAG_SIGNATURE: u64 = 6;

const OP_PUT: u8 = 1;
const OP_INVALIDATE: u8 = 2;
const OP_UNPUBLISH: u8 = 3;
const OP_DELETE: u8 = 4;

// Delta sub-envelope tags for the admin operations.
const DTAG_AT: u64 = 1;
const DTAG_REASON: u64 = 2;

/// A record mutation and the fields it merges into the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Store a new record. Carries the full record.
    Put(Record),
    /// Block resolution of the record.
    Invalidate {
        /// Unix time (seconds) of the invalidation.
        at_unix: i64,
        /// Operator-supplied reason; never empty.
        reason: String,
    },
    /// Withdraw the record from public resolution.
    Unpublish {
        /// Unix time (seconds) of the unpublish.
        at_unix: i64,
    },
    /// Tombstone the record.
    Delete {
        /// Unix time (seconds) of the deletion.
        at_unix: i64,
    },
}

impl Operation {
    /// Wire code of the operation.
    pub fn code(&self) -> u8 {
        match self {
            Self::Put(_) => OP_PUT,
            Self::Invalidate { .. } => OP_INVALIDATE,
            Self::Unpublish { .. } => OP_UNPUBLISH,
            Self::Delete { .. } => OP_DELETE,
        }
    }

    /// Short name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Put(_) => "put",
            Self::Invalidate { .. } => "invalidate",
            Self::Unpublish { .. } => "unpublish",
            Self::Delete { .. } => "delete",
        }
    }

    fn encode_delta(&self) -> Vec<u8> {
        match self {
            Self::Put(record) => encode_record(record),
            Self::Invalidate { at_unix, reason } => {
                let mut buf = Vec::new();
                put_ivarint_field(&mut buf, DTAG_AT, *at_unix);
                put_field(&mut buf, DTAG_REASON, reason.as_bytes());
                buf
            }
            Self::Unpublish { at_unix } | Self::Delete { at_unix } => {
                let mut buf = Vec::new();
                put_ivarint_field(&mut buf, DTAG_AT, *at_unix);
                buf
            }
        }
    }

    fn decode_delta(code: u8, payload: &[u8]) -> Result<Self, CodecError> {
        match code {
            OP_PUT => Ok(Self::Put(decode_record(payload)?)),
            OP_INVALIDATE => {
                let (at_unix, reason) = decode_admin_delta(payload, true)?;
                Ok(Self::Invalidate { at_unix, reason })
            }
            OP_UNPUBLISH => {
                let (at_unix, _) = decode_admin_delta(payload, false)?;
                Ok(Self::Unpublish { at_unix })
            }
            OP_DELETE => {
                let (at_unix, _) = decode_admin_delta(payload, false)?;
                Ok(Self::Delete { at_unix })
            }
            code => Err(CodecError::InvalidCode {
                what: "operation",
                code,
            }),
        }
    }
}

fn decode_admin_delta(payload: &[u8], want_reason: bool) -> Result<(i64, String), CodecError> {
    let mut at_unix = 0i64;
    let mut reason = String::new();
    for field in FieldReader::new(payload) {
        let (tag, bytes) = field?;
        match tag {
            DTAG_AT => at_unix = field_ivarint(bytes)?,
            DTAG_REASON if want_reason => reason = field_string(bytes, "reason")?,
            _ => {}
        }
    }
    Ok((at_unix, reason))
}

/// One signed mutation event, the primary unit of replication.
///
/// `(node_id, clock)` is globally unique; `clock` is strictly increasing
/// per origin node across process restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// The node that originated the entry.
    pub node_id: NodeId,
    /// The origin's monotonic counter at emission.
    pub clock: u64,
    /// The record the entry mutates.
    pub key_hash: KeyHash,
    /// The mutation and its delta.
    pub operation: Operation,
    /// ed25519 signature over [`canonical_for_signing`].
    pub signature: [u8; 64],
}

impl LogEntry {
    /// Create and sign an entry in one step.
    pub fn new_signed(
        node_id: NodeId,
        clock: u64,
        key_hash: KeyHash,
        operation: Operation,
        signing_key: &SigningKey,
    ) -> Self {
        let mut entry = Self {
            node_id,
            clock,
            key_hash,
            operation,
            signature: [0u8; 64],
        };
        let signature: Signature = signing_key.sign(&canonical_for_signing(&entry));
        entry.signature = signature.to_bytes();
        entry
    }

    /// Verify the signature against the origin's public key.
    pub fn verify(&self, verifying_key: &VerifyingKey) -> Result<(), CodecError> {
        let signature = Signature::from_bytes(&self.signature);
        verifying_key
            .verify(&canonical_for_signing(self), &signature)
            .map_err(|_| CodecError::SignatureInvalid)
    }
}

/// The canonical byte form an entry's signature covers: every field except
/// the signature, tags ascending.
pub fn canonical_for_signing(entry: &LogEntry) -> Vec<u8> {
    let mut buf = Vec::with_capacity(128);
    put_field(&mut buf, TAG_NODE_ID, entry.node_id.as_bytes());
    put_uvarint_field(&mut buf, TAG_CLOCK, entry.clock);
    put_field(&mut buf, TAG_KEY_HASH, entry.key_hash.as_bytes());
    put_field(&mut buf, TAG_OPERATION, &[entry.operation.code()]);
    put_field(&mut buf, TAG_DELTA, &entry.operation.encode_delta());
    buf
}

/// Encode an entry, signature included.
pub fn encode_entry(entry: &LogEntry) -> Vec<u8> {
    let mut buf = canonical_for_signing(entry);
    put_field(&mut buf, TAG_SIGNATURE, &entry.signature);
    buf
}

/// Decode an entry envelope. Unknown tags are skipped; the signature is
/// *not* verified here — callers check it against their roster.
pub fn decode_entry(bytes: &[u8]) -> Result<LogEntry, CodecError> {
    let mut node_id = None;
    let mut clock = None;
    let mut key_hash = None;
    let mut op_code = None;
    let mut delta: Option<&[u8]> = None;
    let mut signature = None;

    for field in FieldReader::new(bytes) {
        let (tag, payload) = field?;
        match tag {
            TAG_NODE_ID => node_id = Some(NodeId::from(field_array::<16>(payload, "node_id")?)),
            TAG_CLOCK => clock = Some(field_uvarint(payload)?),
            TAG_KEY_HASH => {
                key_hash = Some(KeyHash::from(field_array::<32>(payload, "key_hash")?));
            }
            TAG_OPERATION => {
                op_code = Some(*payload.first().ok_or(CodecError::BadFieldLength {
                    field: "operation",
                    len: 0,
                })?);
            }
            TAG_DELTA => delta = Some(payload),
            TAG_SIGNATURE => signature = Some(field_array::<64>(payload, "signature")?),
            _ => {}
        }
    }

    let op_code = op_code.ok_or(CodecError::MissingField("operation"))?;
    Ok(LogEntry {
        node_id: node_id.ok_or(CodecError::MissingField("node_id"))?,
        clock: clock.ok_or(CodecError::MissingField("clock"))?,
        key_hash: key_hash.ok_or(CodecError::MissingField("key_hash"))?,
        operation: Operation::decode_delta(op_code, delta.unwrap_or_default())?,
        signature: signature.ok_or(CodecError::MissingField("signature"))?,
    })
}
