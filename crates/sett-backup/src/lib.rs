//! Periodic full snapshots streamed to an object store.
//!
//! The backup worker runs one cycle per interval: it takes a snapshot
//! stream from the engine (reads never block writers), pipes it into the
//! object store under a dated key, and reports failures in the dedicated
//! backup error class. Cycles never overlap — there is exactly one loop —
//! and a failed upload simply waits for the next tick.
//!
//! The real object store (an S3-compatible service) is an external
//! collaborator: only the [`ObjectStore::put_object`] contract matters
//! here. [`FsObjectStore`] ships for operators backing up to a mounted
//! path, and tests use a recording mock.

mod fs_store;

pub use fs_store::FsObjectStore;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sett_db::{Db, DbError};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{error, info};

/// Errors in the backup class. Backups never block writes; every failure
/// is absorbed by the cycle and retried on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Snapshot stream failure from the engine.
    #[error("backup: snapshot: {0}")]
    Snapshot(#[from] DbError),

    /// Local I/O failure while piping the stream.
    #[error("backup: io: {0}")]
    Io(#[from] std::io::Error),

    /// The object store rejected or aborted the upload.
    #[error("backup: upload object: {0}")]
    Upload(String),

    /// The wall clock failed to format into an object key.
    #[error("backup: timestamp: {0}")]
    Timestamp(String),
}

/// The object-store contract the backup worker needs.
///
/// `size == -1` selects a chunked/streaming upload of unknown length.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `reader`'s content under `bucket`/`key`. Returns the number
    /// of bytes uploaded.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        size: i64,
    ) -> Result<u64, BackupError>;
}

/// Backup worker configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Target bucket.
    pub bucket: String,
    /// Object key prefix; the node id and date path are appended.
    pub prefix: String,
    /// How often full backups run.
    pub interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: String::new(),
            interval: Duration::from_secs(3600),
        }
    }
}

/// The backup job: snapshots the engine into the object store on a cycle.
///
/// The engine permits one open handle per data directory, so the worker
/// shares the same [`Db`] as the write path rather than opening its own.
pub struct Backup {
    db: Arc<Db>,
    store: Arc<dyn ObjectStore>,
    config: BackupConfig,
}

impl Backup {
    /// Create a backup job.
    pub fn new(db: Arc<Db>, store: Arc<dyn ObjectStore>, config: BackupConfig) -> Self {
        Self { db, store, config }
    }

    /// Run backup cycles until `shutdown` flips.
    ///
    /// The first cycle runs a full interval after start, so a crash-looping
    /// process does not hammer the object store.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            bucket = %self.config.bucket,
            interval_secs = self.config.interval.as_secs(),
            "backup worker started"
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Swallow the immediate first tick: delay-start.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            match self.run_once().await {
                Ok((key, bytes)) => info!(%key, bytes, "backup uploaded"),
                Err(e) => error!(%e, "backup cycle failed"),
            }
        }
        info!("backup worker stopped");
    }

    /// Perform one full backup. Returns the object key and bytes uploaded.
    ///
    /// The snapshot is piped through an in-process duplex stream into a
    /// chunked upload (`size = -1`), so the full stream is never held by
    /// the object-store client.
    pub async fn run_once(&self) -> Result<(String, u64), BackupError> {
        let key = self.object_key(now_unix())?;

        let db = self.db.clone();
        let frames = tokio::task::spawn_blocking(move || {
            let mut buf = Vec::new();
            db.write_snapshot(&mut buf).map(|_| buf)
        })
        .await
        .map_err(|e| BackupError::Upload(format!("snapshot task: {e}")))??;

        let (mut writer, mut reader) = tokio::io::duplex(64 * 1024);
        let feeder = tokio::spawn(async move {
            let result = writer.write_all(&frames).await;
            let _ = writer.shutdown().await;
            result
        });

        let bytes = self
            .store
            .put_object(&self.config.bucket, &key, &mut reader, -1)
            .await?;

        feeder
            .await
            .map_err(|e| BackupError::Upload(format!("pipe task: {e}")))??;

        Ok((key, bytes))
    }

    /// Build the dated object key:
    /// `<prefix>/<node_id>/<yyyy>/<mm>/<dd>/<rfc3339>`.
    fn object_key(&self, now_unix: i64) -> Result<String, BackupError> {
        let now = OffsetDateTime::from_unix_timestamp(now_unix)
            .map_err(|e| BackupError::Timestamp(e.to_string()))?;
        let stamp = now
            .format(&Rfc3339)
            .map_err(|e| BackupError::Timestamp(e.to_string()))?;
        let mut parts = Vec::new();
        if !self.config.prefix.is_empty() {
            parts.push(self.config.prefix.clone());
        }
        parts.push(self.db.node_id().to_string());
        parts.push(format!(
            "{:04}/{:02}/{:02}",
            now.year(),
            u8::from(now.month()),
            now.day()
        ));
        parts.push(stamp);
        Ok(parts.join("/"))
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use ed25519_dalek::SigningKey;
    use sett_codec::Roster;
    use sett_db::DbOptions;
    use sett_types::{KeyHash, NodeId, Record};
    use tokio::io::AsyncReadExt;

    fn test_db(seed: u8) -> Arc<Db> {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let node_id = NodeId::from([seed; 16]);
        let mut roster = Roster::new();
        roster.insert(node_id, signing_key.verifying_key());
        Arc::new(Db::in_memory(node_id, signing_key, roster, DbOptions::default()).unwrap())
    }

    fn grant_record(grant: &[u8]) -> Record {
        Record::new(
            0,
            true,
            "1sat@eu1.example.net:7777".into(),
            vec![],
            vec![1; 48],
            grant.to_vec(),
            0,
        )
    }

    /// Records every upload for later inspection.
    #[derive(Default)]
    struct MockObjectStore {
        uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
    }

    #[async_trait::async_trait]
    impl ObjectStore for MockObjectStore {
        async fn put_object(
            &self,
            bucket: &str,
            key: &str,
            reader: &mut (dyn AsyncRead + Send + Unpin),
            size: i64,
        ) -> Result<u64, BackupError> {
            assert_eq!(size, -1, "backups stream with unknown size");
            let mut data = Vec::new();
            reader.read_to_end(&mut data).await?;
            let len = data.len() as u64;
            self.uploads
                .lock()
                .unwrap()
                .push((bucket.to_owned(), key.to_owned(), data));
            Ok(len)
        }
    }

    #[tokio::test]
    async fn test_backup_round_trips_into_fresh_engine() {
        let db = test_db(1);
        db.put(KeyHash::from([1u8; 32]), grant_record(b"g1")).unwrap();
        db.put(KeyHash::from([2u8; 32]), grant_record(b"g2")).unwrap();
        db.unpublish(KeyHash::from([2u8; 32])).unwrap();

        let store = Arc::new(MockObjectStore::default());
        let backup = Backup::new(
            db.clone(),
            store.clone(),
            BackupConfig {
                bucket: "sett-backups".into(),
                prefix: "prod".into(),
                ..BackupConfig::default()
            },
        );

        let (key, bytes) = backup.run_once().await.unwrap();
        assert!(bytes > 0);

        let uploads = store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let (bucket, stored_key, data) = &uploads[0];
        assert_eq!(bucket, "sett-backups");
        assert_eq!(stored_key, &key);
        assert_eq!(data.len() as u64, bytes);

        // Restoring the uploaded stream into a fresh engine yields the
        // same resolution results.
        let restored = test_db(2);
        restored.restore_snapshot(&mut data.as_slice()).unwrap();
        assert_eq!(
            restored
                .get(KeyHash::from([1u8; 32]))
                .unwrap()
                .encrypted_access_grant,
            b"g1"
        );
        assert!(!restored.get(KeyHash::from([2u8; 32])).unwrap().public);
        assert_eq!(
            db.snapshot_records().unwrap(),
            restored.snapshot_records().unwrap()
        );
    }

    #[tokio::test]
    async fn test_object_key_layout() {
        let db = test_db(1);
        let backup = Backup::new(
            db.clone(),
            Arc::new(MockObjectStore::default()),
            BackupConfig {
                bucket: "b".into(),
                prefix: "backups/prod".into(),
                ..BackupConfig::default()
            },
        );

        // 2022-04-13T03:42:07Z
        let key = backup.object_key(1_649_821_327).unwrap();
        let expected_prefix = format!("backups/prod/{}/2022/04/13/", db.node_id());
        assert!(
            key.starts_with(&expected_prefix),
            "key {key} missing prefix {expected_prefix}"
        );
        assert!(key.ends_with("2022-04-13T03:42:07Z"));
    }

    #[tokio::test]
    async fn test_empty_prefix_is_omitted() {
        let db = test_db(1);
        let backup = Backup::new(
            db.clone(),
            Arc::new(MockObjectStore::default()),
            BackupConfig {
                bucket: "b".into(),
                ..BackupConfig::default()
            },
        );
        let key = backup.object_key(0).unwrap();
        assert!(key.starts_with(&db.node_id().to_string()));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let backup = Backup::new(
            test_db(1),
            Arc::new(MockObjectStore::default()),
            BackupConfig {
                bucket: "b".into(),
                interval: Duration::from_millis(10),
                ..BackupConfig::default()
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { backup.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
