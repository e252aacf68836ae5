//! Conflict resolution for concurrent entries on the same key hash.
//!
//! A record is the join of two independent halves, each with its own
//! provenance key:
//!
//! - the **payload** half (issuing `Put` fields), keyed by
//!   `(put_clock, put_node_id)` — the *lowest* key wins, so the first
//!   writer wins deterministically on every node;
//! - the **state** half (admin mutation fields), keyed by
//!   `(state rank, state_clock, state_node_id)` — the *highest* key wins,
//!   so `Delete` dominates `Invalidate` dominates `Unpublish`, and a later
//!   `Put` can never clear an admin flag.
//!
//! Both joins are commutative, associative, and idempotent, so nodes
//! applying the same entries in any order converge to identical bytes.

use sett_codec::Operation;
use sett_types::{NodeId, Record, RecordState};

/// Result of merging one operation into the stored record.
pub(crate) struct MergeOutcome {
    /// The joined record to store.
    pub record: Record,
    /// Whether the stored bytes changed.
    pub changed: bool,
    /// The operation was a `Put` against an already-issued key hash.
    /// Key hashes are unique per issuance, so this indicates an upstream
    /// front-end collision and is surfaced as a metric.
    pub put_collision: bool,
}

/// Join two records for the same key hash.
///
/// Used both when applying a single remote entry and when adopting a full
/// record during snapshot catch-up.
pub fn join_records(local: &Record, remote: &Record) -> Record {
    let payload_src = if payload_key(remote) < payload_key(local) {
        remote
    } else {
        local
    };
    let state_src = if state_key(remote) > state_key(local) {
        remote
    } else {
        local
    };

    Record {
        created_at_unix: payload_src.created_at_unix,
        public: payload_src.public,
        satellite_address: payload_src.satellite_address.clone(),
        macaroon_head: payload_src.macaroon_head.clone(),
        encrypted_secret_key: payload_src.encrypted_secret_key.clone(),
        encrypted_access_grant: payload_src.encrypted_access_grant.clone(),
        expires_at_unix: payload_src.expires_at_unix,
        invalidated_at_unix: state_src.invalidated_at_unix,
        invalidation_reason: state_src.invalidation_reason.clone(),
        tombstoned_at_unix: state_src.tombstoned_at_unix,
        state: state_src.state,
        put_clock: payload_src.put_clock,
        put_node_id: payload_src.put_node_id,
        state_clock: state_src.state_clock,
        state_node_id: state_src.state_node_id,
    }
}

/// Merge an operation originating from `(node_id, clock)` into the stored
/// record, if any.
pub(crate) fn apply_operation(
    existing: Option<&Record>,
    node_id: NodeId,
    clock: u64,
    operation: &Operation,
) -> MergeOutcome {
    let candidate = candidate_record(node_id, clock, operation);
    let put_collision = matches!(operation, Operation::Put(_))
        && existing.is_some_and(|record| record.put_clock != 0);

    let record = match existing {
        Some(existing) => join_records(existing, &candidate),
        None => candidate,
    };
    let changed = existing != Some(&record);

    MergeOutcome {
        record,
        changed,
        put_collision,
    }
}

/// Build the record an operation stands for on its own.
///
/// A `Put` carries the payload half with a clean `Live` state half (any
/// state fields smuggled into the issued record are dropped, identically
/// on every node). Admin operations carry a state half over an empty
/// payload shell, so they merge correctly even when they arrive before
/// the `Put` they refer to.
fn candidate_record(node_id: NodeId, clock: u64, operation: &Operation) -> Record {
    match operation {
        Operation::Put(record) => {
            let mut record = record.clone();
            record.state = RecordState::Live;
            record.invalidated_at_unix = 0;
            record.invalidation_reason = String::new();
            record.tombstoned_at_unix = 0;
            record.state_clock = 0;
            record.state_node_id = NodeId::ZERO;
            record.put_clock = clock;
            record.put_node_id = node_id;
            record
        }
        Operation::Invalidate { at_unix, reason } => {
            let mut record = shell();
            record.state = RecordState::Invalidated;
            record.invalidated_at_unix = *at_unix;
            record.invalidation_reason = reason.clone();
            record.state_clock = clock;
            record.state_node_id = node_id;
            record
        }
        Operation::Unpublish { .. } => {
            let mut record = shell();
            record.state = RecordState::Unpublished;
            record.state_clock = clock;
            record.state_node_id = node_id;
            record
        }
        Operation::Delete { at_unix } => {
            let mut record = shell();
            record.state = RecordState::Tombstoned;
            record.tombstoned_at_unix = *at_unix;
            record.state_clock = clock;
            record.state_node_id = node_id;
            record
        }
    }
}

/// An empty record: no payload, `Live`, no provenance.
fn shell() -> Record {
    Record::new(0, false, String::new(), Vec::new(), Vec::new(), Vec::new(), 0)
}

/// Payload ordering key. `put_clock == 0` means "no put yet" and loses to
/// any real put, hence `u64::MAX`.
fn payload_key(record: &Record) -> (u64, NodeId) {
    if record.put_clock == 0 {
        (u64::MAX, NodeId::from([0xff; 16]))
    } else {
        (record.put_clock, record.put_node_id)
    }
}

/// State ordering key: `(rank, clock, node_id)` lexicographic.
fn state_key(record: &Record) -> (u8, u64, NodeId) {
    (record.state.rank(), record.state_clock, record.state_node_id)
}
