//! The cluster roster: which nodes may author log entries.

use std::collections::HashMap;

use ed25519_dalek::VerifyingKey;
use sett_types::{NodeId, PeerEntry};

use crate::error::CodecError;
use crate::entry::LogEntry;

/// Maps every cluster node to the ed25519 key that verifies its entries.
///
/// The roster is fixed at startup from configuration. An entry signed by a
/// node outside the roster is rejected the same way as a bad signature.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    keys: HashMap<NodeId, VerifyingKey>,
}

impl Roster {
    /// An empty roster (single-node deployments verify only themselves).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a roster from configured peers plus the local node.
    pub fn from_peers(
        local: (NodeId, VerifyingKey),
        peers: &[PeerEntry],
    ) -> Result<Self, CodecError> {
        let mut roster = Self::new();
        roster.insert(local.0, local.1);
        for peer in peers {
            let key = VerifyingKey::from_bytes(&peer.public_key)
                .map_err(|_| CodecError::SignatureInvalid)?;
            roster.insert(peer.node_id, key);
        }
        Ok(roster)
    }

    /// Register a node's verifying key.
    pub fn insert(&mut self, node_id: NodeId, key: VerifyingKey) {
        self.keys.insert(node_id, key);
    }

    /// Look up a node's verifying key.
    pub fn key_for(&self, node_id: &NodeId) -> Option<&VerifyingKey> {
        self.keys.get(node_id)
    }

    /// Whether the node is a known cluster member.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.keys.contains_key(node_id)
    }

    /// All roster node ids.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.keys.keys()
    }

    /// Verify an entry against the roster.
    ///
    /// Fails with [`CodecError::SignatureInvalid`] when the origin node is
    /// unknown or the signature does not verify.
    pub fn verify_entry(&self, entry: &LogEntry) -> Result<(), CodecError> {
        let key = self
            .key_for(&entry.node_id)
            .ok_or(CodecError::SignatureInvalid)?;
        entry.verify(key)
    }
}
