//! [`Db`] — the replicated credential store engine.
//!
//! Every mutation flows through the log: a locally originated write
//! reserves a clock value, signs a [`LogEntry`], and commits the entry,
//! the merged record, and the clock in one fsynced batch. Remote entries
//! arrive through [`Db::apply_entry`] and go through the same merge rules,
//! advancing the per-peer high-water mark in the same batch.

use std::io::{Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sett_codec::{LogEntry, Operation, Roster, decode_entry, decode_record, encode_entry, encode_record};
use sett_types::{KeyHash, NodeId, Record, RecordState};
use tracing::{debug, warn};

use crate::CredentialStore;
use crate::clock::Clock;
use crate::error::DbError;
use crate::merge;
use crate::store::{Batch, Space, Store};

type Result<T> = std::result::Result<T, DbError>;

const META_CLOCK: &[u8] = b"clock";
const META_NODE_ID: &[u8] = b"node_id";

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Reject `put_record` calls whose record has no expiry.
    pub require_expiry: bool,
    /// How long tombstones are retained before GC purges them. Must exceed
    /// the longest legitimate TTL plus worst-case replication lag.
    pub tombstone_retention_secs: u64,
    /// How long log entries are retained. Must exceed the maximum
    /// tolerable peer downtime; a peer that falls further behind catches
    /// up from a snapshot instead.
    pub log_retention_secs: u64,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            require_expiry: false,
            tombstone_retention_secs: 14 * 24 * 3600,
            log_retention_secs: 7 * 24 * 3600,
        }
    }
}

/// Counters from one garbage collection sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    /// Expired records removed.
    pub expired_removed: u64,
    /// Tombstones past their retention window removed.
    pub tombstones_purged: u64,
}

/// One row of a snapshot stream: `(keyspace, key, value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFrame {
    /// [`Space`] code.
    pub space: u8,
    /// Raw key bytes.
    pub key: Vec<u8>,
    /// Raw value bytes.
    pub value: Vec<u8>,
}

/// The embedded replicated credential store engine.
///
/// All methods take `&self`; concurrent writers within the process are
/// serialized by an internal mutex, mirroring the single-writer batch
/// discipline of the storage engine underneath.
pub struct Db {
    store: Store,
    clock: Clock,
    node_id: NodeId,
    signing_key: SigningKey,
    roster: Roster,
    options: DbOptions,
    /// Serializes read-merge-write cycles.
    write_lock: Mutex<()>,
    /// Ignored same-key `Put`s — front-end collisions that should never
    /// happen in production.
    put_collisions: AtomicU64,
}

impl Db {
    /// Open (or create) a persistent engine in `path`.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        node_id: NodeId,
        signing_key: SigningKey,
        roster: Roster,
        options: DbOptions,
    ) -> Result<Self> {
        Self::from_store(Store::open(path)?, node_id, signing_key, roster, options)
    }

    /// Create a pure in-memory engine (tests, ephemeral deployments).
    pub fn in_memory(
        node_id: NodeId,
        signing_key: SigningKey,
        roster: Roster,
        options: DbOptions,
    ) -> Result<Self> {
        Self::from_store(Store::in_memory(), node_id, signing_key, roster, options)
    }

    fn from_store(
        store: Store,
        node_id: NodeId,
        signing_key: SigningKey,
        roster: Roster,
        options: DbOptions,
    ) -> Result<Self> {
        // A data directory is bound to one node identity for its lifetime.
        match store.get(Space::Meta, META_NODE_ID)? {
            Some(bytes) => {
                let found = NodeId::from_bytes(&bytes)
                    .map_err(|e| DbError::Corrupt(e.to_string()))?;
                if found != node_id {
                    return Err(DbError::NodeMismatch {
                        found,
                        configured: node_id,
                    });
                }
            }
            None => {
                let mut batch = Batch::new();
                batch.put(Space::Meta, META_NODE_ID, node_id.as_bytes().to_vec());
                store.commit(batch)?;
            }
        }

        let persisted = match store.get(Space::Meta, META_CLOCK)? {
            Some(bytes) => decode_be_u64(&bytes)?,
            None => 0,
        };
        // The clock is committed in the same batch as every own-log entry,
        // so anything above the persisted value would be a torn write; the
        // scan is a recovery guard, not the normal path.
        let tail = store.scan_range(
            Space::Log,
            &log_key(node_id, persisted.saturating_add(1)),
            &log_key(node_id, u64::MAX),
            usize::MAX,
        )?;
        let recovered = tail
            .last()
            .map(|(key, _)| clock_from_log_key(key))
            .transpose()?
            .unwrap_or(0);

        let db = Self {
            store,
            clock: Clock::new(persisted.max(recovered)),
            node_id,
            signing_key,
            roster,
            options,
            write_lock: Mutex::new(()),
            put_collisions: AtomicU64::new(0),
        };
        debug!(node_id = %db.node_id, clock = db.clock.current(), "engine opened");
        Ok(db)
    }

    /// This node's identifier.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The most recently reserved clock value.
    pub fn clock_value(&self) -> u64 {
        self.clock.current()
    }

    /// How many same-key `Put`s have been ignored since startup.
    pub fn put_collisions(&self) -> u64 {
        self.put_collisions.load(Ordering::Relaxed)
    }

    // -------------------------------------------------------------------
    // Resolver operations
    // -------------------------------------------------------------------

    /// Store a new record. The creation time is stamped here.
    pub fn put(&self, key_hash: KeyHash, mut record: Record) -> Result<()> {
        if self.options.require_expiry && record.expires_at_unix == 0 {
            return Err(DbError::InvalidRequest("record expiry is required"));
        }
        let now = now_unix();
        record.created_at_unix = now;

        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut reclaim_expired = false;
        if let Some(existing) = self.load_record(key_hash)? {
            // An expired row the GC has not swept yet does not block
            // reissuing; anything else does, tombstones included.
            if existing.state == RecordState::Live && existing.is_expired(now) {
                reclaim_expired = true;
            } else {
                return Err(DbError::AlreadyExists);
            }
        }
        if reclaim_expired {
            let mut batch = Batch::new();
            batch.remove(Space::Records, key_hash.as_bytes().to_vec());
            self.store.commit(batch)?;
        }
        self.append_inner(key_hash, Operation::Put(record))?;
        Ok(())
    }

    /// Resolve the live record for a key hash.
    ///
    /// An `Unpublished` record is returned with `public` forced to `false`;
    /// the front-end only releases it against proof of the user secret.
    pub fn get(&self, key_hash: KeyHash) -> Result<Record> {
        let Some(record) = self.load_record(key_hash)? else {
            return Err(DbError::NotFound);
        };
        match record.state {
            RecordState::Tombstoned => Err(DbError::NotFound),
            _ if record.is_expired(now_unix()) => {
                // Expiry is deterministic from the record itself, so the
                // eager delete needs no log entry: every node does the same.
                let _guard = self.write_lock.lock().expect("write lock poisoned");
                let mut batch = Batch::new();
                batch.remove(Space::Records, key_hash.as_bytes().to_vec());
                self.store.commit(batch)?;
                debug!(%key_hash, "eagerly deleted expired record");
                Err(DbError::Expired)
            }
            RecordState::Invalidated => Err(DbError::Invalidated {
                reason: record.invalidation_reason.clone(),
            }),
            RecordState::Unpublished => Ok(Record {
                public: false,
                ..record
            }),
            RecordState::Live => Ok(record),
        }
    }

    /// Raw record load for admin inspection: no state interpretation, no
    /// expiry side effects.
    pub fn inspect(&self, key_hash: KeyHash) -> Result<Option<Record>> {
        self.load_record(key_hash)
    }

    /// Tombstone a record. Succeeds even when no record exists locally yet:
    /// the tombstone shell still replicates and blocks a racing `Put`.
    pub fn delete(&self, key_hash: KeyHash) -> Result<()> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        self.append_inner(
            key_hash,
            Operation::Delete {
                at_unix: now_unix(),
            },
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Admin operations
    // -------------------------------------------------------------------

    /// Block resolution of a record. The reason is mandatory.
    pub fn invalidate(&self, key_hash: KeyHash, reason: &str) -> Result<()> {
        if reason.is_empty() {
            return Err(DbError::InvalidRequest("missing invalidation reason"));
        }
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if self.load_record(key_hash)?.is_none() {
            return Err(DbError::NotFound);
        }
        self.append_inner(
            key_hash,
            Operation::Invalidate {
                at_unix: now_unix(),
                reason: reason.to_owned(),
            },
        )?;
        Ok(())
    }

    /// Withdraw a record from public resolution.
    pub fn unpublish(&self, key_hash: KeyHash) -> Result<()> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        if self.load_record(key_hash)?.is_none() {
            return Err(DbError::NotFound);
        }
        self.append_inner(
            key_hash,
            Operation::Unpublish {
                at_unix: now_unix(),
            },
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------
    // Log operations
    // -------------------------------------------------------------------

    /// Append a locally originated operation. Assumes the write lock is held.
    fn append_inner(&self, key_hash: KeyHash, operation: Operation) -> Result<u64> {
        let clock = self.clock.next();
        let entry = LogEntry::new_signed(
            self.node_id,
            clock,
            key_hash,
            operation,
            &self.signing_key,
        );

        let existing = self.load_record(key_hash)?;
        let outcome =
            merge::apply_operation(existing.as_ref(), self.node_id, clock, &entry.operation);

        let mut batch = Batch::new();
        if outcome.changed {
            batch.put(
                Space::Records,
                key_hash.as_bytes().to_vec(),
                encode_record(&outcome.record),
            );
        }
        batch.put(
            Space::Log,
            log_key(self.node_id, clock).to_vec(),
            stamp_entry(now_unix(), &encode_entry(&entry)),
        );
        batch.put(Space::Meta, META_CLOCK, clock.to_be_bytes().to_vec());
        self.store.commit(batch)?;

        debug!(
            %key_hash,
            clock,
            op = entry.operation.name(),
            "appended log entry"
        );
        Ok(clock)
    }

    /// Apply one foreign entry. Idempotent: returns `Ok(false)` when the
    /// entry is already covered by the origin's high-water mark.
    ///
    /// Fails with [`DbError::SignatureInvalid`] before touching any state
    /// when the signature or origin is bad, and with
    /// [`DbError::ReplicationGap`] when the entry skips clock values — the
    /// caller then falls back to snapshot catch-up.
    pub fn apply_entry(&self, entry: &LogEntry) -> Result<bool> {
        if entry.node_id == self.node_id {
            // Our own entries come back from peers that relayed them.
            return Ok(false);
        }
        self.roster.verify_entry(entry)?;

        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let highwater = self.highwater(entry.node_id)?;
        if entry.clock <= highwater {
            return Ok(false);
        }
        if entry.clock != highwater + 1 {
            return Err(DbError::ReplicationGap {
                node_id: entry.node_id,
                expected: highwater + 1,
                got: entry.clock,
            });
        }

        let existing = self.load_record(entry.key_hash)?;
        let outcome = merge::apply_operation(
            existing.as_ref(),
            entry.node_id,
            entry.clock,
            &entry.operation,
        );

        let mut batch = Batch::new();
        if outcome.changed {
            batch.put(
                Space::Records,
                entry.key_hash.as_bytes().to_vec(),
                encode_record(&outcome.record),
            );
        }
        batch.put(
            Space::Log,
            log_key(entry.node_id, entry.clock).to_vec(),
            stamp_entry(now_unix(), &encode_entry(entry)),
        );
        batch.put(
            Space::HighWater,
            entry.node_id.as_bytes().to_vec(),
            entry.clock.to_be_bytes().to_vec(),
        );
        self.store.commit(batch)?;

        if outcome.put_collision {
            self.put_collisions.fetch_add(1, Ordering::Relaxed);
            warn!(
                key_hash = %entry.key_hash,
                origin = %entry.node_id,
                "ignored put for an already-issued key hash (front-end collision)"
            );
        }
        Ok(true)
    }

    /// Bounded ordered scan of a node's log, starting at `from_clock`.
    pub fn range(&self, node_id: NodeId, from_clock: u64, limit: usize) -> Result<Vec<LogEntry>> {
        let rows = self.store.scan_range(
            Space::Log,
            &log_key(node_id, from_clock),
            &log_key(node_id, u64::MAX),
            limit,
        )?;
        rows.iter()
            .map(|(_, value)| decode_stamped_entry(value).map(|(_, entry)| entry))
            .collect()
    }

    /// Like [`Db::range`], but returns the stored canonical entry bytes.
    ///
    /// The serving side of replication ships these bytes untouched, so the
    /// puller verifies exactly what the origin signed.
    pub fn range_raw(
        &self,
        node_id: NodeId,
        from_clock: u64,
        limit: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let rows = self.store.scan_range(
            Space::Log,
            &log_key(node_id, from_clock),
            &log_key(node_id, u64::MAX),
            limit,
        )?;
        rows.iter()
            .map(|(_, value)| split_stamp(value).map(|(_, bytes)| bytes.to_vec()))
            .collect()
    }

    /// The oldest clock value still retained for a node; 0 when no entries
    /// are held. Lets the serving side report trims to pullers.
    pub fn earliest_retained(&self, node_id: NodeId) -> Result<u64> {
        let rows = self.store.scan_range(
            Space::Log,
            &log_key(node_id, 0),
            &log_key(node_id, u64::MAX),
            1,
        )?;
        rows.first()
            .map(|(key, _)| clock_from_log_key(key))
            .unwrap_or(Ok(0))
    }

    /// The newest clock value this node holds for `node_id`: the local
    /// clock for itself, the high-water mark for a peer.
    pub fn latest_clock(&self, node_id: NodeId) -> Result<u64> {
        if node_id == self.node_id {
            Ok(self.clock.current())
        } else {
            self.highwater(node_id)
        }
    }

    /// Highest clock applied from the given peer.
    pub fn highwater(&self, node_id: NodeId) -> Result<u64> {
        match self.store.get(Space::HighWater, node_id.as_bytes())? {
            Some(bytes) => decode_be_u64(&bytes),
            None => Ok(0),
        }
    }

    /// High-water marks for every peer this node has applied entries from.
    pub fn highwaters(&self) -> Result<Vec<(NodeId, u64)>> {
        self.store
            .iter_all(Space::HighWater)?
            .into_iter()
            .map(|(key, value)| {
                let node_id =
                    NodeId::from_bytes(&key).map_err(|e| DbError::Corrupt(e.to_string()))?;
                Ok((node_id, decode_be_u64(&value)?))
            })
            .collect()
    }

    // -------------------------------------------------------------------
    // Snapshot catch-up (replication)
    // -------------------------------------------------------------------

    /// Dump the full record space as `(key_hash, encoded record)` pairs.
    pub fn snapshot_records(&self) -> Result<Vec<(KeyHash, Vec<u8>)>> {
        self.store
            .iter_all(Space::Records)?
            .into_iter()
            .map(|(key, value)| {
                let key_hash =
                    KeyHash::from_bytes(&key).map_err(|e| DbError::Corrupt(e.to_string()))?;
                Ok((key_hash, value))
            })
            .collect()
    }

    /// Adopt a peer's record space after a replication gap.
    ///
    /// Each remote record is merged under the usual rules rather than
    /// copied, so catch-up can never regress local dominance state. The
    /// peer's high-water mark jumps to `new_highwater` (its current clock)
    /// in the same batch.
    pub fn adopt_records(
        &self,
        peer: NodeId,
        records: &[(KeyHash, Vec<u8>)],
        new_highwater: u64,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut batch = Batch::new();
        let mut changed = 0;
        for (key_hash, bytes) in records {
            let remote = decode_record(bytes)?;
            let merged = match self.load_record(*key_hash)? {
                Some(local) => {
                    let joined = merge::join_records(&local, &remote);
                    if joined == local {
                        continue;
                    }
                    joined
                }
                None => remote,
            };
            batch.put(
                Space::Records,
                key_hash.as_bytes().to_vec(),
                encode_record(&merged),
            );
            changed += 1;
        }
        batch.put(
            Space::HighWater,
            peer.as_bytes().to_vec(),
            new_highwater.to_be_bytes().to_vec(),
        );
        self.store.commit(batch)?;
        Ok(changed)
    }

    // -------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------

    /// Remove expired records and aged-out tombstones.
    ///
    /// Emits no log entries: expiry is deterministic from the record, so
    /// every node sweeps identically on its own schedule.
    pub fn run_ttl_gc_once(&self) -> Result<GcStats> {
        let now = now_unix();
        let mut stats = GcStats::default();
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut batch = Batch::new();
        for (key, value) in self.store.iter_all(Space::Records)? {
            let record = decode_record(&value)?;
            if record.state == RecordState::Tombstoned {
                let purge_at = record
                    .tombstoned_at_unix
                    .saturating_add(self.options.tombstone_retention_secs as i64);
                if now >= purge_at {
                    batch.remove(Space::Records, key);
                    stats.tombstones_purged += 1;
                }
            } else if record.is_expired(now) {
                batch.remove(Space::Records, key);
                stats.expired_removed += 1;
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }
        Ok(stats)
    }

    /// Trim log entries past the retention window.
    ///
    /// Ages against the local received-at stamp, which is nondecreasing in
    /// clock order per node, so an age trim is always a prefix trim.
    pub fn trim_log_once(&self) -> Result<u64> {
        let now = now_unix();
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut batch = Batch::new();
        let mut removed = 0;
        for (key, value) in self.store.iter_all(Space::Log)? {
            let (received_at, _) = split_stamp(&value)?;
            if now >= received_at.saturating_add(self.options.log_retention_secs as i64) {
                batch.remove(Space::Log, key);
                removed += 1;
            }
        }
        if !batch.is_empty() {
            self.store.commit(batch)?;
        }
        Ok(removed)
    }

    // -------------------------------------------------------------------
    // Backup snapshots
    // -------------------------------------------------------------------

    /// Dump every keyspace as snapshot frames.
    ///
    /// Reads never block writers: the dump runs against the engine's
    /// point-in-time iterators.
    pub fn snapshot_frames(&self) -> Result<Vec<SnapshotFrame>> {
        let mut frames = Vec::new();
        for space in Space::ALL {
            for (key, value) in self.store.iter_all(space)? {
                frames.push(SnapshotFrame {
                    space: space.code(),
                    key,
                    value,
                });
            }
        }
        Ok(frames)
    }

    /// Serialize snapshot frames into a writer as length-prefixed postcard
    /// frames. Returns the number of bytes written.
    pub fn write_snapshot(&self, writer: &mut dyn Write) -> Result<u64> {
        let mut written = 0u64;
        for frame in self.snapshot_frames()? {
            let bytes = postcard::to_allocvec(&frame)?;
            writer.write_all(&(bytes.len() as u32).to_be_bytes())?;
            writer.write_all(&bytes)?;
            written += 4 + bytes.len() as u64;
        }
        Ok(written)
    }

    /// Load a snapshot stream into this (fresh) engine.
    ///
    /// Returns the number of frames applied. The clock advances to the
    /// restored value so the engine cannot reissue old clock values.
    pub fn restore_snapshot(&self, reader: &mut dyn Read) -> Result<u64> {
        let _guard = self.write_lock.lock().expect("write lock poisoned");
        let mut frames = 0u64;
        let mut batch = Batch::new();
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut bytes = vec![0u8; len];
            reader.read_exact(&mut bytes)?;
            let frame: SnapshotFrame = postcard::from_bytes(&bytes)?;
            let space = Space::from_code(frame.space)
                .ok_or_else(|| DbError::Corrupt(format!("unknown keyspace code {}", frame.space)))?;
            // The restored identity is the snapshot's own, not ours to keep.
            if space == Space::Meta && frame.key == META_NODE_ID {
                continue;
            }
            batch.put(space, frame.key, frame.value);
            frames += 1;

            if batch.len() >= 1000 {
                self.store.commit(std::mem::take(&mut batch))?;
            }
        }
        self.store.commit(batch)?;

        if let Some(bytes) = self.store.get(Space::Meta, META_CLOCK)? {
            self.clock.advance_to(decode_be_u64(&bytes)?);
        }
        Ok(frames)
    }

    // -------------------------------------------------------------------

    /// Raw record load with no state or expiry interpretation.
    fn load_record(&self, key_hash: KeyHash) -> Result<Option<Record>> {
        match self.store.get(Space::Records, key_hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl CredentialStore for Db {
    fn put_record(&self, key_hash: KeyHash, record: Record) -> Result<()> {
        self.put(key_hash, record)
    }

    fn get_record(&self, key_hash: KeyHash) -> Result<Record> {
        self.get(key_hash)
    }

    fn delete_record(&self, key_hash: KeyHash) -> Result<()> {
        self.delete(key_hash)
    }
}

/// `node_id ‖ clock_be` — big-endian clocks make prefix scans stream in
/// clock order.
fn log_key(node_id: NodeId, clock: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(node_id.as_bytes());
    key[16..].copy_from_slice(&clock.to_be_bytes());
    key
}

fn clock_from_log_key(key: &[u8]) -> Result<u64> {
    if key.len() != 24 {
        return Err(DbError::Corrupt(format!("log key length {}", key.len())));
    }
    decode_be_u64(&key[16..])
}

/// Log values carry a local received-at stamp ahead of the signed bytes,
/// for retention trimming only. The stamp is never signed or replicated.
fn stamp_entry(received_at_unix: i64, entry_bytes: &[u8]) -> Vec<u8> {
    let mut value = Vec::with_capacity(8 + entry_bytes.len());
    value.extend_from_slice(&received_at_unix.to_be_bytes());
    value.extend_from_slice(entry_bytes);
    value
}

fn split_stamp(value: &[u8]) -> Result<(i64, &[u8])> {
    if value.len() < 8 {
        return Err(DbError::Corrupt("log value shorter than stamp".into()));
    }
    let stamp = i64::from_be_bytes(value[..8].try_into().expect("8-byte slice"));
    Ok((stamp, &value[8..]))
}

fn decode_stamped_entry(value: &[u8]) -> Result<(i64, LogEntry)> {
    let (stamp, bytes) = split_stamp(value)?;
    Ok((stamp, decode_entry(bytes)?))
}

fn decode_be_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| DbError::Corrupt(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}

/// Wall-clock seconds since the epoch.
pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
