//! Engine-level tests: resolver semantics, log invariants, merge
//! dominance, TTL, retention, and snapshot round-trips.

use ed25519_dalek::SigningKey;
use sett_codec::{LogEntry, Operation, Roster};
use sett_types::{KeyHash, NodeId, Record, RecordState};

use crate::db::now_unix;
use crate::{Db, DbError, DbOptions};

fn node(b: u8) -> NodeId {
    NodeId::from([b; 16])
}

fn key(b: u8) -> KeyHash {
    KeyHash::from([b; 32])
}

fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

/// Roster with nodes 1 and 2 (seeds 1 and 2).
fn cluster_roster() -> Roster {
    let mut roster = Roster::new();
    roster.insert(node(1), signing_key(1).verifying_key());
    roster.insert(node(2), signing_key(2).verifying_key());
    roster
}

fn test_db(node_seed: u8) -> Db {
    Db::in_memory(
        node(node_seed),
        signing_key(node_seed),
        cluster_roster(),
        DbOptions::default(),
    )
    .unwrap()
}

fn grant_record(grant: &[u8]) -> Record {
    Record::new(
        0,
        true,
        "1sat@eu1.example.net:7777".into(),
        vec![0xaa; 16],
        vec![1; 48],
        grant.to_vec(),
        0,
    )
}

/// Pull every entry of `from`'s own log into `to`.
fn replicate(from: &Db, to: &Db) -> usize {
    let origin = from.node_id();
    let start = to.highwater(origin).unwrap() + 1;
    let entries = from.range(origin, start, usize::MAX).unwrap();
    let mut applied = 0;
    for entry in &entries {
        if to.apply_entry(entry).unwrap() {
            applied += 1;
        }
    }
    applied
}

// -----------------------------------------------------------------------
// Resolver semantics
// -----------------------------------------------------------------------

#[test]
fn test_put_get_single_node() {
    let db = test_db(1);
    db.put(key(0x01), grant_record(b"g1")).unwrap();

    let record = db.get(key(0x01)).unwrap();
    assert_eq!(record.encrypted_access_grant, b"g1");
    assert!(record.public);
    assert!(record.created_at_unix > 0);

    assert!(matches!(db.get(key(0x02)), Err(DbError::NotFound)));
}

#[test]
fn test_put_twice_is_already_exists() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    assert!(matches!(
        db.put(key(1), grant_record(b"g2")),
        Err(DbError::AlreadyExists)
    ));
    // The original payload is untouched.
    assert_eq!(db.get(key(1)).unwrap().encrypted_access_grant, b"g1");
}

#[test]
fn test_put_requires_expiry_when_configured() {
    let db = Db::in_memory(
        node(1),
        signing_key(1),
        cluster_roster(),
        DbOptions {
            require_expiry: true,
            ..DbOptions::default()
        },
    )
    .unwrap();

    assert!(matches!(
        db.put(key(1), grant_record(b"g1")),
        Err(DbError::InvalidRequest(_))
    ));

    let mut record = grant_record(b"g1");
    record.expires_at_unix = now_unix() + 3600;
    db.put(key(1), record).unwrap();
}

#[test]
fn test_invalidate_then_get() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.invalidate(key(1), "credential abuse").unwrap();

    match db.get(key(1)) {
        Err(DbError::Invalidated { reason }) => assert_eq!(reason, "credential abuse"),
        other => panic!("expected Invalidated, got {other:?}"),
    }
}

#[test]
fn test_invalidate_requires_reason_and_record() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();

    assert!(matches!(
        db.invalidate(key(1), ""),
        Err(DbError::InvalidRequest(_))
    ));
    assert!(matches!(
        db.invalidate(key(9), "whatever"),
        Err(DbError::NotFound)
    ));
}

#[test]
fn test_unpublish_hides_public_flag() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.unpublish(key(1)).unwrap();

    let record = db.get(key(1)).unwrap();
    assert!(!record.public);
    assert_eq!(record.state, RecordState::Unpublished);
    assert_eq!(record.encrypted_access_grant, b"g1");
}

#[test]
fn test_delete_leaves_tombstone_blocking_reput() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.delete(key(1)).unwrap();

    assert!(matches!(db.get(key(1)), Err(DbError::NotFound)));
    // The tombstone blocks reissuing the same key hash.
    assert!(matches!(
        db.put(key(1), grant_record(b"g2")),
        Err(DbError::AlreadyExists)
    ));
}

#[test]
fn test_delete_without_record_still_replicates_a_tombstone() {
    let a = test_db(1);
    let b = test_db(2);

    // Delete races ahead of the put on node 1.
    a.delete(key(1)).unwrap();
    replicate(&a, &b);

    // The put arrives at node 2 afterwards; the tombstone must win.
    b.put(key(1), grant_record(b"g1")).unwrap_err();
}

// -----------------------------------------------------------------------
// TTL
// -----------------------------------------------------------------------

#[test]
fn test_expired_get_deletes_eagerly() {
    let db = test_db(1);
    let mut record = grant_record(b"g1");
    record.expires_at_unix = now_unix() - 1;
    db.put(key(1), record).unwrap();

    assert!(matches!(db.get(key(1)), Err(DbError::Expired)));
    // The eager delete removed the row, so the next read is NotFound.
    assert!(matches!(db.get(key(1)), Err(DbError::NotFound)));
    assert!(db.snapshot_records().unwrap().is_empty());
}

#[test]
fn test_expired_key_hash_can_be_reissued() {
    let db = test_db(1);
    let mut record = grant_record(b"g1");
    record.expires_at_unix = now_unix() - 1;
    db.put(key(1), record).unwrap();

    // Expired rows do not block a fresh issuance, swept or not.
    db.put(key(1), grant_record(b"g2")).unwrap();
    assert_eq!(db.get(key(1)).unwrap().encrypted_access_grant, b"g2");
}

#[test]
fn test_gc_sweeps_expired_records() {
    let db = test_db(1);
    let mut expiring = grant_record(b"g1");
    expiring.expires_at_unix = now_unix() - 10;
    db.put(key(1), expiring).unwrap();
    db.put(key(2), grant_record(b"g2")).unwrap();

    let stats = db.run_ttl_gc_once().unwrap();
    assert_eq!(stats.expired_removed, 1);
    assert_eq!(stats.tombstones_purged, 0);
    assert!(matches!(db.get(key(1)), Err(DbError::NotFound)));
    db.get(key(2)).unwrap();
}

#[test]
fn test_gc_purges_tombstones_after_retention() {
    let db = Db::in_memory(
        node(1),
        signing_key(1),
        cluster_roster(),
        DbOptions {
            tombstone_retention_secs: 0,
            ..DbOptions::default()
        },
    )
    .unwrap();
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.delete(key(1)).unwrap();

    let stats = db.run_ttl_gc_once().unwrap();
    assert_eq!(stats.tombstones_purged, 1);
    assert!(db.snapshot_records().unwrap().is_empty());
}

#[test]
fn test_gc_keeps_fresh_tombstones() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.delete(key(1)).unwrap();

    let stats = db.run_ttl_gc_once().unwrap();
    assert_eq!(stats.tombstones_purged, 0);
    assert_eq!(db.snapshot_records().unwrap().len(), 1);
}

// -----------------------------------------------------------------------
// Log invariants
// -----------------------------------------------------------------------

#[test]
fn test_own_log_is_gapless_and_signed() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.put(key(2), grant_record(b"g2")).unwrap();
    db.invalidate(key(1), "abuse").unwrap();
    db.delete(key(2)).unwrap();

    let entries = db.range(node(1), 1, usize::MAX).unwrap();
    assert_eq!(entries.len(), 4);
    let roster = cluster_roster();
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.clock, i as u64 + 1);
        roster.verify_entry(entry).unwrap();
    }
    assert_eq!(db.clock_value(), 4);
}

#[test]
fn test_every_record_has_a_log_chain() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.invalidate(key(1), "abuse").unwrap();

    let entries = db.range(node(1), 1, usize::MAX).unwrap();
    let for_key: Vec<&LogEntry> = entries.iter().filter(|e| e.key_hash == key(1)).collect();
    assert_eq!(for_key.len(), 2);
    assert!(matches!(for_key[0].operation, Operation::Put(_)));
    assert!(matches!(for_key[1].operation, Operation::Invalidate { .. }));
}

#[test]
fn test_range_is_bounded() {
    let db = test_db(1);
    for i in 0..10u8 {
        db.put(key(i), grant_record(b"g")).unwrap();
    }
    let entries = db.range(node(1), 3, 4).unwrap();
    let clocks: Vec<u64> = entries.iter().map(|e| e.clock).collect();
    assert_eq!(clocks, vec![3, 4, 5, 6]);
}

#[test]
fn test_clock_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let db = Db::open(
            dir.path(),
            node(1),
            signing_key(1),
            cluster_roster(),
            DbOptions::default(),
        )
        .unwrap();
        db.put(key(1), grant_record(b"g1")).unwrap();
        db.put(key(2), grant_record(b"g2")).unwrap();
        assert_eq!(db.clock_value(), 2);
    }
    let db = Db::open(
        dir.path(),
        node(1),
        signing_key(1),
        cluster_roster(),
        DbOptions::default(),
    )
    .unwrap();
    assert_eq!(db.clock_value(), 2);
    db.put(key(3), grant_record(b"g3")).unwrap();
    let entries = db.range(node(1), 1, usize::MAX).unwrap();
    let clocks: Vec<u64> = entries.iter().map(|e| e.clock).collect();
    assert_eq!(clocks, vec![1, 2, 3]);
    // Records written before the reopen are still resolvable.
    db.get(key(1)).unwrap();
}

#[test]
fn test_reopen_with_wrong_identity_fails() {
    let dir = tempfile::tempdir().unwrap();
    {
        Db::open(
            dir.path(),
            node(1),
            signing_key(1),
            cluster_roster(),
            DbOptions::default(),
        )
        .unwrap();
    }
    assert!(matches!(
        Db::open(
            dir.path(),
            node(2),
            signing_key(2),
            cluster_roster(),
            DbOptions::default(),
        ),
        Err(DbError::NodeMismatch { .. })
    ));
}

// -----------------------------------------------------------------------
// Applying foreign entries
// -----------------------------------------------------------------------

#[test]
fn test_two_node_convergence() {
    let a = test_db(1);
    let b = test_db(2);

    a.put(key(1), grant_record(b"from-a")).unwrap();
    b.put(key(2), grant_record(b"from-b")).unwrap();

    replicate(&a, &b);
    replicate(&b, &a);

    for db in [&a, &b] {
        assert_eq!(db.get(key(1)).unwrap().encrypted_access_grant, b"from-a");
        assert_eq!(db.get(key(2)).unwrap().encrypted_access_grant, b"from-b");
    }
    // Convergence is bytewise: identical record spaces.
    assert_eq!(a.snapshot_records().unwrap(), b.snapshot_records().unwrap());
}

#[test]
fn test_apply_is_idempotent() {
    let a = test_db(1);
    let b = test_db(2);
    a.put(key(1), grant_record(b"g1")).unwrap();

    let entries = a.range(node(1), 1, usize::MAX).unwrap();
    assert!(b.apply_entry(&entries[0]).unwrap());
    let snapshot = b.snapshot_records().unwrap();

    assert!(!b.apply_entry(&entries[0]).unwrap());
    assert_eq!(b.snapshot_records().unwrap(), snapshot);
    assert_eq!(b.highwater(node(1)).unwrap(), 1);
}

#[test]
fn test_invalidation_dominates_duplicate_put() {
    let a = test_db(1);
    let b = test_db(2);

    // Put on A, replicate to B, invalidate on B.
    a.put(key(0xaa), grant_record(b"g1")).unwrap();
    replicate(&a, &b);
    b.invalidate(key(0xaa), "abuse").unwrap();

    // A concurrently attempts a duplicate issuance before B's
    // invalidation arrives; the live record blocks it.
    assert!(matches!(
        a.put(key(0xaa), grant_record(b"dup")),
        Err(DbError::AlreadyExists)
    ));

    replicate(&b, &a);

    for db in [&a, &b] {
        assert!(matches!(
            db.get(key(0xaa)),
            Err(DbError::Invalidated { .. })
        ));
    }
    assert_eq!(a.snapshot_records().unwrap(), b.snapshot_records().unwrap());
}

#[test]
fn test_unknown_signer_is_rejected_without_highwater_advance() {
    let b = test_db(2);
    // Node 3 is not in the roster.
    let rogue = LogEntry::new_signed(
        node(3),
        1,
        key(1),
        Operation::Put(grant_record(b"evil")),
        &signing_key(3),
    );
    assert!(matches!(
        b.apply_entry(&rogue),
        Err(DbError::SignatureInvalid)
    ));
    assert_eq!(b.highwater(node(3)).unwrap(), 0);
    assert!(b.snapshot_records().unwrap().is_empty());
}

#[test]
fn test_tampered_entry_is_rejected() {
    let a = test_db(1);
    let b = test_db(2);
    a.put(key(1), grant_record(b"g1")).unwrap();

    let mut entry = a.range(node(1), 1, 1).unwrap().remove(0);
    if let Operation::Put(record) = &mut entry.operation {
        record.encrypted_access_grant = b"tampered".to_vec();
    }
    assert!(matches!(
        b.apply_entry(&entry),
        Err(DbError::SignatureInvalid)
    ));
    assert_eq!(b.highwater(node(1)).unwrap(), 0);
}

#[test]
fn test_clock_gap_is_reported() {
    let a = test_db(1);
    let b = test_db(2);
    a.put(key(1), grant_record(b"g1")).unwrap();
    a.put(key(2), grant_record(b"g2")).unwrap();
    a.put(key(3), grant_record(b"g3")).unwrap();

    let entries = a.range(node(1), 1, usize::MAX).unwrap();
    b.apply_entry(&entries[0]).unwrap();
    // Skipping clock 2 must not be silently absorbed.
    match b.apply_entry(&entries[2]) {
        Err(DbError::ReplicationGap { expected, got, .. }) => {
            assert_eq!(expected, 2);
            assert_eq!(got, 3);
        }
        other => panic!("expected ReplicationGap, got {other:?}"),
    }
    assert_eq!(b.highwater(node(1)).unwrap(), 1);
}

#[test]
fn test_apply_ignores_own_entries() {
    let a = test_db(1);
    a.put(key(1), grant_record(b"g1")).unwrap();
    let entry = a.range(node(1), 1, 1).unwrap().remove(0);
    assert!(!a.apply_entry(&entry).unwrap());
}

// -----------------------------------------------------------------------
// Snapshot catch-up
// -----------------------------------------------------------------------

#[test]
fn test_adopt_records_after_trim() {
    let a = test_db(1);
    let b = test_db(2);

    a.put(key(1), grant_record(b"g1")).unwrap();
    a.put(key(2), grant_record(b"g2")).unwrap();
    a.invalidate(key(2), "abuse").unwrap();

    // B adopts A's record space wholesale, as it would after finding A's
    // log trimmed past its high-water mark.
    let records = a.snapshot_records().unwrap();
    let adopted = b.adopt_records(node(1), &records, a.clock_value()).unwrap();
    assert_eq!(adopted, 2);
    assert_eq!(b.highwater(node(1)).unwrap(), a.clock_value());

    assert_eq!(b.get(key(1)).unwrap().encrypted_access_grant, b"g1");
    assert!(matches!(b.get(key(2)), Err(DbError::Invalidated { .. })));
    assert_eq!(a.snapshot_records().unwrap(), b.snapshot_records().unwrap());
}

#[test]
fn test_adopt_records_cannot_regress_local_state() {
    let a = test_db(1);
    let b = test_db(2);

    // Both hold the record; B has since invalidated it.
    a.put(key(1), grant_record(b"g1")).unwrap();
    replicate(&a, &b);
    b.invalidate(key(1), "abuse").unwrap();

    // Adopting A's (older) snapshot must not clear B's invalidation.
    let records = a.snapshot_records().unwrap();
    b.adopt_records(node(1), &records, a.clock_value()).unwrap();
    assert!(matches!(b.get(key(1)), Err(DbError::Invalidated { .. })));
}

// -----------------------------------------------------------------------
// Log retention
// -----------------------------------------------------------------------

#[test]
fn test_log_trim_respects_retention() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    // Entries were received just now; the default window keeps them.
    assert_eq!(db.trim_log_once().unwrap(), 0);
    assert_eq!(db.range(node(1), 1, usize::MAX).unwrap().len(), 1);
}

#[test]
fn test_log_trim_removes_aged_entries() {
    let db = Db::in_memory(
        node(1),
        signing_key(1),
        cluster_roster(),
        DbOptions {
            log_retention_secs: 0,
            ..DbOptions::default()
        },
    )
    .unwrap();
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.put(key(2), grant_record(b"g2")).unwrap();

    assert_eq!(db.trim_log_once().unwrap(), 2);
    assert!(db.range(node(1), 1, usize::MAX).unwrap().is_empty());
    assert_eq!(db.earliest_retained(node(1)).unwrap(), 0);
    // Records survive the trim; only history is dropped.
    db.get(key(1)).unwrap();
}

// -----------------------------------------------------------------------
// Snapshots
// -----------------------------------------------------------------------

#[test]
fn test_snapshot_restore_round_trip() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    db.put(key(2), grant_record(b"g2")).unwrap();
    db.unpublish(key(2)).unwrap();

    let mut stream = Vec::new();
    let written = db.write_snapshot(&mut stream).unwrap();
    assert_eq!(written, stream.len() as u64);

    let restored = Db::in_memory(
        node(2),
        signing_key(2),
        cluster_roster(),
        DbOptions::default(),
    )
    .unwrap();
    restored.restore_snapshot(&mut stream.as_slice()).unwrap();

    assert_eq!(restored.get(key(1)).unwrap().encrypted_access_grant, b"g1");
    let unpublished = restored.get(key(2)).unwrap();
    assert!(!unpublished.public);
    assert_eq!(
        db.snapshot_records().unwrap(),
        restored.snapshot_records().unwrap()
    );
    // The restored clock covers the snapshot's history.
    assert_eq!(restored.clock_value(), db.clock_value());
}

#[test]
fn test_snapshot_does_not_block_reads() {
    let db = test_db(1);
    db.put(key(1), grant_record(b"g1")).unwrap();
    let frames = db.snapshot_frames().unwrap();
    assert!(!frames.is_empty());
    db.get(key(1)).unwrap();
    db.put(key(2), grant_record(b"g2")).unwrap();
}

// -----------------------------------------------------------------------
// Collision metric
// -----------------------------------------------------------------------

#[test]
fn test_put_collision_is_counted() {
    let a = test_db(1);
    let b = test_db(2);

    a.put(key(1), grant_record(b"from-a")).unwrap();
    b.put(key(1), grant_record(b"from-b")).unwrap();

    replicate(&a, &b);
    replicate(&b, &a);

    assert_eq!(a.put_collisions(), 1);
    assert_eq!(b.put_collisions(), 1);
    // Both nodes agree on the deterministic first writer.
    assert_eq!(
        a.get(key(1)).unwrap().encrypted_access_grant,
        b.get(key(1)).unwrap().encrypted_access_grant
    );
    assert_eq!(a.snapshot_records().unwrap(), b.snapshot_records().unwrap());
}
