//! Shared types and identifiers for the sett credential store.
//!
//! This crate defines the core types used across the sett workspace:
//! identifiers ([`KeyHash`], [`NodeId`]), the stored [`Record`] with its
//! lifecycle [`RecordState`], and the cluster roster entry [`PeerEntry`].

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Errors produced when constructing identifiers from raw bytes.
#[derive(Debug, thiserror::Error)]
pub enum IdError {
    /// A key hash must be exactly 32 bytes.
    #[error("key hash must be 32 bytes, got {0}")]
    KeyHashLength(usize),

    /// A node id must be exactly 16 bytes.
    #[error("node id must be 16 bytes, got {0}")]
    NodeIdLength(usize),

    /// The hex string could not be decoded.
    #[error("invalid hex in identifier")]
    Hex,
}

// ---------------------------------------------------------------------------
// KeyHash
// ---------------------------------------------------------------------------

/// SHA-256 of a plaintext Access Key ID; the primary store key.
///
/// The raw Access Key ID is never persisted — every store lookup goes
/// through this hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct KeyHash([u8; 32]);

impl KeyHash {
    /// Hash a plaintext Access Key ID.
    pub fn from_access_key_id(access_key_id: &str) -> Self {
        let digest = Sha256::digest(access_key_id.as_bytes());
        Self(digest.into())
    }

    /// Construct from raw bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdError::KeyHashLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex_decode(s).ok_or(IdError::Hex)?;
        Self::from_bytes(&bytes)
    }

    /// Return the raw 32-byte representation.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for KeyHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for KeyHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash({self})")
    }
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Identifier for a cluster node, assigned in configuration.
///
/// Distinct from the node's signing key: the roster maps a `NodeId` to the
/// ed25519 key that verifies its log entries.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// The all-zero node id, used as the "unset" provenance marker.
    pub const ZERO: NodeId = NodeId([0u8; 16]);

    /// Construct from raw bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| IdError::NodeIdLength(bytes.len()))?;
        Ok(Self(arr))
    }

    /// Parse from a 32-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex_decode(s).ok_or(IdError::Hex)?;
        Self::from_bytes(&bytes)
    }

    /// Return the raw 16-byte representation.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for NodeId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Lifecycle state of a stored record.
///
/// States form a total dominance order: once a record reaches a higher
/// state it can never move back down, on any node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordState {
    /// Retrievable, payload intact.
    Live,
    /// Hidden from public resolution; retrievable only with proof of the
    /// user secret.
    Unpublished,
    /// Blocked by an administrator; resolution returns an error.
    Invalidated,
    /// Deleted; the shell is retained until the tombstone retention window
    /// passes so offline peers still observe the deletion.
    Tombstoned,
}

impl RecordState {
    /// Dominance rank. Higher rank always wins a merge.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Live => 0,
            Self::Unpublished => 1,
            Self::Invalidated => 2,
            Self::Tombstoned => 3,
        }
    }

    /// Wire code for the codec envelope.
    pub fn code(&self) -> u8 {
        self.rank()
    }

    /// Decode from a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Live),
            1 => Some(Self::Unpublished),
            2 => Some(Self::Invalidated),
            3 => Some(Self::Tombstoned),
            _ => None,
        }
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Live => "live",
            Self::Unpublished => "unpublished",
            Self::Invalidated => "invalidated",
            Self::Tombstoned => "tombstoned",
        };
        f.write_str(s)
    }
}

/// The stored value bound to a [`KeyHash`].
///
/// The `encrypted_*` payload fields are opaque to the store: they are
/// encrypted at the front-end with a key derived from the user-chosen
/// secret. `macaroon_head` identifies the underlying access grant for
/// telemetry and is never used for lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Unix time (seconds) when the credential was issued.
    pub created_at_unix: i64,
    /// Whether the grant is retrievable without presenting the secret.
    pub public: bool,
    /// Target storage cluster address.
    pub satellite_address: String,
    /// Cryptographic head of the wrapped access grant (telemetry only).
    pub macaroon_head: Vec<u8>,
    /// Secret key, encrypted at the front-end.
    pub encrypted_secret_key: Vec<u8>,
    /// Access grant, encrypted at the front-end.
    pub encrypted_access_grant: Vec<u8>,
    /// Unix time (seconds) after which the record expires; 0 = no expiry.
    pub expires_at_unix: i64,
    /// Unix time (seconds) of admin invalidation; 0 when not invalidated.
    pub invalidated_at_unix: i64,
    /// Operator-supplied invalidation reason.
    pub invalidation_reason: String,
    /// Unix time (seconds) when the tombstone was written; 0 when the
    /// record is not tombstoned. Drives tombstone retention.
    pub tombstoned_at_unix: i64,
    /// Lifecycle state.
    pub state: RecordState,
    /// Clock of the issuing `Put` entry; 0 for a shell created by an admin
    /// entry that arrived before its `Put`.
    pub put_clock: u64,
    /// Node that authored the issuing `Put`.
    pub put_node_id: NodeId,
    /// Clock of the entry that last raised `state`; 0 while `Live`.
    pub state_clock: u64,
    /// Node that authored that state change.
    pub state_node_id: NodeId,
}

impl Record {
    /// A fresh live record with the given payload.
    pub fn new(
        created_at_unix: i64,
        public: bool,
        satellite_address: String,
        macaroon_head: Vec<u8>,
        encrypted_secret_key: Vec<u8>,
        encrypted_access_grant: Vec<u8>,
        expires_at_unix: i64,
    ) -> Self {
        Self {
            created_at_unix,
            public,
            satellite_address,
            macaroon_head,
            encrypted_secret_key,
            encrypted_access_grant,
            expires_at_unix,
            invalidated_at_unix: 0,
            invalidation_reason: String::new(),
            tombstoned_at_unix: 0,
            state: RecordState::Live,
            put_clock: 0,
            put_node_id: NodeId::ZERO,
            state_clock: 0,
            state_node_id: NodeId::ZERO,
        }
    }

    /// Whether the record has passed its expiry time.
    ///
    /// Records with `expires_at_unix == 0` never expire.
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expires_at_unix != 0 && now_unix >= self.expires_at_unix
    }
}

// ---------------------------------------------------------------------------
// Roster entry
// ---------------------------------------------------------------------------

/// One remote peer in the configured cluster roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    /// The peer's node identifier.
    pub node_id: NodeId,
    /// Dial address (endpoint id, optionally `endpoint-id@host:port`).
    pub address: String,
    /// The peer's ed25519 public key (verifies its log entries and
    /// authenticates its transport connections).
    pub public_key: [u8; 32],
}

/// Decode a hex string into bytes. Returns `None` on odd length or
/// non-hex characters.
fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
