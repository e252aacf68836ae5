//! The per-peer replication worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use sett_codec::decode_entry;
use sett_db::{Db, DbError};
use sett_net::Transport;
use sett_types::{KeyHash, NodeId};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::ReplError;

/// Address book entry for one peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    /// The peer's node identifier.
    pub node_id: NodeId,
    /// Where to dial it.
    pub addr: iroh::EndpointAddr,
}

/// Tuning for a replication worker.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// How often to poll the peer.
    pub interval: Duration,
    /// Maximum entries per pull.
    pub batch: u32,
    /// Per-batch deadline; exceeding it aborts the batch without
    /// advancing the high-water mark.
    pub deadline: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch: 1000,
            deadline: Duration::from_secs(30),
        }
    }
}

/// Pulls one peer's log into the local engine.
pub struct Replicator {
    db: Arc<Db>,
    transport: Arc<dyn Transport>,
    peer: PeerHandle,
    config: ReplicatorConfig,
    /// Entries applied from this peer since startup.
    applied: AtomicU64,
    /// Entries rejected for bad signatures since startup.
    rejected: AtomicU64,
}

impl Replicator {
    /// Create a worker for one peer.
    pub fn new(
        db: Arc<Db>,
        transport: Arc<dyn Transport>,
        peer: PeerHandle,
        config: ReplicatorConfig,
    ) -> Self {
        Self {
            db,
            transport,
            peer,
            config,
            applied: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// The peer this worker tails.
    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    /// Entries applied from this peer since startup.
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Entries rejected for bad signatures since startup.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Run the pull loop until `shutdown` flips.
    ///
    /// Transient failures back off exponentially, capped at the poll
    /// interval. A storage failure stops the worker: the engine below is
    /// broken and retrying cannot help.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        // Jittered start so a cluster restart doesn't phase-lock pulls.
        let jitter = Duration::from_millis(
            rand::rng().random_range(0..=self.config.interval.as_millis().max(1) as u64 / 5),
        );
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown.changed() => return,
        }

        info!(peer = %self.peer.node_id, "replication worker started");
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut backoff = Duration::from_millis(100);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            match timeout(self.config.deadline, self.pull_once()).await {
                Ok(Ok(0)) => {
                    backoff = Duration::from_millis(100);
                }
                Ok(Ok(applied)) => {
                    debug!(peer = %self.peer.node_id, applied, "pulled entries");
                    backoff = Duration::from_millis(100);
                }
                Ok(Err(e)) if e.is_transient() => {
                    debug!(peer = %self.peer.node_id, %e, "pull failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    backoff = (backoff * 2).min(self.config.interval);
                }
                Ok(Err(e)) => {
                    error!(peer = %self.peer.node_id, %e, "replication worker stopping");
                    return;
                }
                Err(_) => {
                    // Deadline exceeded mid-batch: the high-water mark was
                    // only advanced for entries already applied, so the
                    // next pull resumes cleanly.
                    warn!(peer = %self.peer.node_id, "pull deadline exceeded, batch aborted");
                }
            }
        }
        info!(peer = %self.peer.node_id, "replication worker stopped");
    }

    /// One pull cycle. Returns the number of entries (or adopted records)
    /// applied.
    pub async fn pull_once(&self) -> Result<usize, ReplError> {
        let from_clock = self.db.highwater(self.peer.node_id)? + 1;
        let batch = self
            .transport
            .pull_entries(
                self.peer.addr.clone(),
                self.peer.node_id,
                from_clock,
                self.config.batch,
            )
            .await?;

        // The peer trimmed its log past our mark: its retained history
        // starts after what we asked for (or is gone entirely while its
        // clock has moved on). Tail the log again after adopting a full
        // snapshot.
        let trimmed = batch.earliest_retained > from_clock
            || (batch.entries.is_empty() && batch.current_clock >= from_clock);
        if trimmed {
            return self.catch_up().await;
        }

        let mut applied = 0;
        for bytes in &batch.entries {
            let entry = decode_entry(bytes)?;
            match self.db.apply_entry(&entry) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(DbError::SignatureInvalid) => {
                    // Abort the batch: nothing after a forged entry can be
                    // trusted, and the high-water mark must not move past it.
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        peer = %self.peer.node_id,
                        origin = %entry.node_id,
                        clock = entry.clock,
                        "rejected entry with invalid signature, aborting batch"
                    );
                    return Err(DbError::SignatureInvalid.into());
                }
                Err(DbError::ReplicationGap { .. }) => {
                    return self.catch_up().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.applied.fetch_add(applied as u64, Ordering::Relaxed);
        Ok(applied)
    }

    /// Snapshot catch-up: adopt the peer's full record space and resume
    /// log tailing from its current clock.
    async fn catch_up(&self) -> Result<usize, ReplError> {
        let (records, current_clock) = self.transport.pull_snapshot(self.peer.addr.clone()).await?;
        let pairs: Vec<(KeyHash, Vec<u8>)> = records
            .into_iter()
            .map(|r| (r.key_hash, r.record))
            .collect();
        let changed = self
            .db
            .adopt_records(self.peer.node_id, &pairs, current_clock)?;
        info!(
            peer = %self.peer.node_id,
            records = pairs.len(),
            changed,
            resume_clock = current_clock,
            "snapshot catch-up complete"
        );
        Ok(changed)
    }
}
