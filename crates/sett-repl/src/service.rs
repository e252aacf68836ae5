//! The serving side of replication: answers peer pull requests from the
//! local engine.

use std::sync::Arc;

use sett_db::Db;
use sett_net::{SettMessage, SnapshotRecord};
use tracing::{debug, warn};

/// Answers [`SettMessage`] requests against the local engine.
///
/// Wire-level plumbing (stream accept loops) lives with the transport;
/// this type only maps requests to engine reads, so it is equally usable
/// behind real QUIC streams and test loopbacks.
pub struct ReplicationService {
    db: Arc<Db>,
}

impl ReplicationService {
    /// Create a service over the local engine.
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Handle one request. Returns `None` for messages that expect no
    /// response (or on local read failure, which the puller treats as a
    /// transient timeout).
    pub fn handle(&self, request: SettMessage) -> Option<SettMessage> {
        match request {
            SettMessage::EntriesRequest {
                node_id,
                from_clock,
                limit,
            } => {
                let entries = match self.db.range_raw(node_id, from_clock, limit as usize) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(%node_id, from_clock, %e, "failed to read log range");
                        return None;
                    }
                };
                let earliest_retained = self.db.earliest_retained(node_id).ok()?;
                let current_clock = self.db.latest_clock(node_id).ok()?;
                debug!(
                    %node_id,
                    from_clock,
                    count = entries.len(),
                    "served entries request"
                );
                Some(SettMessage::EntriesResponse {
                    entries,
                    earliest_retained,
                    current_clock,
                })
            }

            SettMessage::SnapshotRequest => {
                let records = match self.db.snapshot_records() {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(%e, "failed to read record snapshot");
                        return None;
                    }
                };
                let records = records
                    .into_iter()
                    .map(|(key_hash, record)| SnapshotRecord { key_hash, record })
                    .collect::<Vec<_>>();
                debug!(count = records.len(), "served snapshot request");
                Some(SettMessage::SnapshotResponse {
                    records,
                    current_clock: self.db.clock_value(),
                })
            }

            SettMessage::Ping { timestamp } => Some(SettMessage::Pong { timestamp }),

            // Responses arriving as requests are protocol misuse; drop them.
            other => {
                debug!("unhandled request: {other:?}");
                None
            }
        }
    }
}
