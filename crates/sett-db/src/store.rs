//! Storage backend: fjall keyspaces on disk, or pure in-memory.
//!
//! Four keyspaces hold the engine state:
//!
//! - `records`   — `key_hash` → encoded record
//! - `log`       — `node_id ‖ clock_be` → received-at stamp ‖ encoded entry
//! - `highwater` — `node_id` → clock_be
//! - `meta`      — engine metadata (`clock`, `node_id`)
//!
//! All writes go through [`Batch`]: a batch commits atomically across
//! keyspaces and is fsynced before the commit returns, so recovery never
//! observes a record without the log entry that produced it.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use fjall::{Database, Keyspace, KeyspaceCreateOptions, PersistMode};

use crate::error::DbError;

type Result<T> = std::result::Result<T, DbError>;

/// The engine's keyspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// `key_hash` → encoded record.
    Records,
    /// `node_id ‖ clock_be` → stamped encoded entry.
    Log,
    /// `node_id` → clock_be.
    HighWater,
    /// Engine metadata.
    Meta,
}

impl Space {
    /// All keyspaces, in snapshot order.
    pub const ALL: [Space; 4] = [Space::Records, Space::Log, Space::HighWater, Space::Meta];

    /// Stable code used in snapshot frames.
    pub fn code(&self) -> u8 {
        match self {
            Self::Records => 0,
            Self::Log => 1,
            Self::HighWater => 2,
            Self::Meta => 3,
        }
    }

    /// Decode a snapshot frame code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Records),
            1 => Some(Self::Log),
            2 => Some(Self::HighWater),
            3 => Some(Self::Meta),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        self.code() as usize
    }
}

enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

/// An atomic multi-keyspace write.
#[derive(Default)]
pub(crate) struct Batch {
    ops: Vec<(Space, BatchOp)>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, space: Space, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push((
            space,
            BatchOp::Put {
                key: key.into(),
                value: value.into(),
            },
        ));
    }

    pub fn remove(&mut self, space: Space, key: impl Into<Vec<u8>>) {
        self.ops.push((space, BatchOp::Remove { key: key.into() }));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Inner backend: either fjall-backed (disk) or pure in-memory.
enum Backend {
    Fjall {
        db: Database,
        records: Keyspace,
        log: Keyspace,
        highwater: Keyspace,
        meta: Keyspace,
    },
    Memory(RwLock<MemoryInner>),
}

/// Pure in-memory storage for zero disk I/O mode.
///
/// One lock guards all four maps so batches stay atomic.
struct MemoryInner {
    spaces: [BTreeMap<Vec<u8>, Vec<u8>>; 4],
}

/// The storage backend shared by every engine component.
pub(crate) struct Store {
    backend: Backend,
}

impl Store {
    /// Open a persistent store at the given path (fjall backend).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::builder(path).open()?;
        let records = db.keyspace("records", KeyspaceCreateOptions::default)?;
        let log = db.keyspace("log", KeyspaceCreateOptions::default)?;
        let highwater = db.keyspace("highwater", KeyspaceCreateOptions::default)?;
        let meta = db.keyspace("meta", KeyspaceCreateOptions::default)?;
        Ok(Self {
            backend: Backend::Fjall {
                db,
                records,
                log,
                highwater,
                meta,
            },
        })
    }

    /// Create a pure in-memory store. Zero disk I/O.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(RwLock::new(MemoryInner {
                spaces: [
                    BTreeMap::new(),
                    BTreeMap::new(),
                    BTreeMap::new(),
                    BTreeMap::new(),
                ],
            })),
        }
    }

    fn keyspace(&self, space: Space) -> &Keyspace {
        match &self.backend {
            Backend::Fjall {
                records,
                log,
                highwater,
                meta,
                ..
            } => match space {
                Space::Records => records,
                Space::Log => log,
                Space::HighWater => highwater,
                Space::Meta => meta,
            },
            Backend::Memory(_) => unreachable!("keyspace() is only called on the fjall backend"),
        }
    }

    /// Point lookup.
    pub fn get(&self, space: Space, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.backend {
            Backend::Fjall { .. } => match self.keyspace(space).get(key)? {
                Some(value) => Ok(Some(value.to_vec())),
                None => Ok(None),
            },
            Backend::Memory(inner) => Ok(inner
                .read()
                .expect("memory store lock poisoned")
                .spaces[space.index()]
                .get(key)
                .cloned()),
        }
    }

    /// Commit a batch atomically, fsyncing before returning.
    pub fn commit(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        match &self.backend {
            Backend::Fjall { db, .. } => {
                let mut write = db.batch();
                for (space, op) in &batch.ops {
                    let keyspace = self.keyspace(*space);
                    match op {
                        BatchOp::Put { key, value } => {
                            write.insert(keyspace, key.as_slice(), value.as_slice());
                        }
                        BatchOp::Remove { key } => write.remove(keyspace, key.as_slice()),
                    }
                }
                write.commit()?;
                db.persist(PersistMode::SyncAll)?;
                Ok(())
            }
            Backend::Memory(inner) => {
                let mut inner = inner.write().expect("memory store lock poisoned");
                for (space, op) in batch.ops {
                    let map = &mut inner.spaces[space.index()];
                    match op {
                        BatchOp::Put { key, value } => {
                            map.insert(key, value);
                        }
                        BatchOp::Remove { key } => {
                            map.remove(&key);
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Ordered scan of `[start, end)`, stopping after `limit` pairs.
    pub fn scan_range(
        &self,
        space: Space,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match &self.backend {
            Backend::Fjall { .. } => {
                let mut out = Vec::new();
                for guard in self.keyspace(space).range(start.to_vec()..end.to_vec()) {
                    if out.len() >= limit {
                        break;
                    }
                    let (key, value) = guard.into_inner()?;
                    out.push((key.to_vec(), value.to_vec()));
                }
                Ok(out)
            }
            Backend::Memory(inner) => {
                let inner = inner.read().expect("memory store lock poisoned");
                Ok(inner.spaces[space.index()]
                    .range(start.to_vec()..end.to_vec())
                    .take(limit)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            }
        }
    }

    /// Full ordered dump of a keyspace.
    pub fn iter_all(&self, space: Space) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match &self.backend {
            Backend::Fjall { .. } => {
                let mut out = Vec::new();
                for guard in self.keyspace(space).iter() {
                    let (key, value) = guard.into_inner()?;
                    out.push((key.to_vec(), value.to_vec()));
                }
                Ok(out)
            }
            Backend::Memory(inner) => {
                let inner = inner.read().expect("memory store lock poisoned");
                Ok(inner.spaces[space.index()]
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(store: &Store) {
        let mut batch = Batch::new();
        batch.put(Space::Records, b"k1".to_vec(), b"v1".to_vec());
        batch.put(Space::Log, b"k1".to_vec(), b"log-v1".to_vec());
        batch.put(Space::Records, b"k2".to_vec(), b"v2".to_vec());
        store.commit(batch).unwrap();

        assert_eq!(store.get(Space::Records, b"k1").unwrap(), Some(b"v1".to_vec()));
        // Same key in a different keyspace is a different row.
        assert_eq!(store.get(Space::Log, b"k1").unwrap(), Some(b"log-v1".to_vec()));
        assert_eq!(store.get(Space::Records, b"missing").unwrap(), None);

        let mut batch = Batch::new();
        batch.remove(Space::Records, b"k1".to_vec());
        store.commit(batch).unwrap();
        assert_eq!(store.get(Space::Records, b"k1").unwrap(), None);
        assert_eq!(store.get(Space::Records, b"k2").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_memory_backend_roundtrip() {
        roundtrip(&Store::in_memory());
    }

    #[test]
    fn test_fjall_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        roundtrip(&Store::open(dir.path()).unwrap());
    }

    #[test]
    fn test_fjall_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            let mut batch = Batch::new();
            batch.put(Space::Meta, b"clock".to_vec(), 42u64.to_be_bytes().to_vec());
            store.commit(batch).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(
            store.get(Space::Meta, b"clock").unwrap(),
            Some(42u64.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn test_scan_range_is_ordered_and_node_scoped() {
        let store = Store::in_memory();
        let mut batch = Batch::new();
        for clock in [3u64, 1, 2] {
            let mut key = vec![0xaa; 16];
            key.extend_from_slice(&clock.to_be_bytes());
            batch.put(Space::Log, key, clock.to_be_bytes().to_vec());
        }
        let mut other = vec![0xbb; 16];
        other.extend_from_slice(&9u64.to_be_bytes());
        batch.put(Space::Log, other, b"other-node".to_vec());
        store.commit(batch).unwrap();

        let mut start = vec![0xaa; 16];
        start.extend_from_slice(&0u64.to_be_bytes());
        let mut end = vec![0xaa; 16];
        end.extend_from_slice(&u64::MAX.to_be_bytes());

        let rows = store.scan_range(Space::Log, &start, &end, usize::MAX).unwrap();
        assert_eq!(rows.len(), 3);
        let clocks: Vec<u64> = rows
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k[16..].try_into().unwrap()))
            .collect();
        assert_eq!(clocks, vec![1, 2, 3]);
    }

    #[test]
    fn test_scan_range_respects_limit() {
        let store = Store::in_memory();
        let mut batch = Batch::new();
        for clock in 1u64..=10 {
            let mut key = vec![0xaa; 16];
            key.extend_from_slice(&clock.to_be_bytes());
            batch.put(Space::Log, key, vec![]);
        }
        store.commit(batch).unwrap();

        let mut start = vec![0xaa; 16];
        start.extend_from_slice(&4u64.to_be_bytes());
        let mut end = vec![0xaa; 16];
        end.extend_from_slice(&u64::MAX.to_be_bytes());

        let rows = store.scan_range(Space::Log, &start, &end, 3).unwrap();
        let clocks: Vec<u64> = rows
            .iter()
            .map(|(k, _)| u64::from_be_bytes(k[16..].try_into().unwrap()))
            .collect();
        assert_eq!(clocks, vec![4, 5, 6]);
    }
}
