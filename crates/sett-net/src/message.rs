//! Protocol messages for the sett network layer.
//!
//! All messages are serialized with postcard over QUIC streams. Log
//! entries travel as their canonical envelope bytes, never re-encoded, so
//! the receiver verifies the exact bytes the origin signed.

use serde::{Deserialize, Serialize};
use sett_types::{KeyHash, NodeId};

/// One record in a snapshot catch-up stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The record's key hash.
    pub key_hash: KeyHash,
    /// Canonical encoded record bytes.
    pub record: Vec<u8>,
}

/// The result of one entries pull, as seen by the replication worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntriesBatch {
    /// Canonical encoded log entries, in clock order.
    pub entries: Vec<Vec<u8>>,
    /// The oldest clock the remote still retains for the requested node;
    /// 0 when it holds no entries. A value above the requested start
    /// means the log was trimmed and the puller must catch up from a
    /// snapshot.
    pub earliest_retained: u64,
    /// The newest clock the remote holds for the requested node.
    pub current_clock: u64,
}

/// Protocol messages exchanged between sett nodes.
///
/// Each message is sent as a length-prefixed postcard-encoded payload
/// over a QUIC stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettMessage {
    /// Request log entries for `node_id` starting at `from_clock`
    /// (bi-directional, expects [`SettMessage::EntriesResponse`]).
    EntriesRequest {
        /// Origin node whose log is being tailed.
        node_id: NodeId,
        /// First clock value wanted.
        from_clock: u64,
        /// Maximum number of entries to return.
        limit: u32,
    },

    /// Response to a [`SettMessage::EntriesRequest`].
    EntriesResponse {
        /// Canonical encoded log entries, in clock order.
        entries: Vec<Vec<u8>>,
        /// Oldest clock retained for the requested node (0 = none).
        earliest_retained: u64,
        /// Newest clock held for the requested node.
        current_clock: u64,
    },

    /// Request the full record space (bi-directional, expects
    /// [`SettMessage::SnapshotResponse`]).
    SnapshotRequest,

    /// Response to a [`SettMessage::SnapshotRequest`].
    SnapshotResponse {
        /// Every record the node holds.
        records: Vec<SnapshotRecord>,
        /// The node's current clock, so the puller can resume log tailing
        /// from here.
        current_clock: u64,
    },

    /// Health check ping.
    Ping {
        /// Timestamp (millis since epoch) when the ping was sent.
        timestamp: u64,
    },

    /// Health check pong (response to [`SettMessage::Ping`]).
    Pong {
        /// Timestamp from the original ping.
        timestamp: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip_postcard() {
        let messages = vec![
            SettMessage::EntriesRequest {
                node_id: NodeId::from([1u8; 16]),
                from_clock: 17,
                limit: 1000,
            },
            SettMessage::EntriesResponse {
                entries: vec![vec![1, 2, 3], vec![4, 5]],
                earliest_retained: 1,
                current_clock: 19,
            },
            SettMessage::SnapshotRequest,
            SettMessage::SnapshotResponse {
                records: vec![SnapshotRecord {
                    key_hash: KeyHash::from([7u8; 32]),
                    record: vec![9; 40],
                }],
                current_clock: 3,
            },
            SettMessage::Ping { timestamp: 123 },
            SettMessage::Pong { timestamp: 123 },
        ];

        for message in messages {
            let bytes = postcard::to_allocvec(&message).unwrap();
            let decoded: SettMessage = postcard::from_bytes(&bytes).unwrap();
            assert_eq!(decoded, message);
        }
    }
}
