//! Filesystem object store for operators backing up to a mounted path.

use std::path::{Path, PathBuf};

use tokio::io::AsyncRead;
use tracing::debug;

use crate::{BackupError, ObjectStore};

/// Stores objects as files under `{base_dir}/{bucket}/{key}`.
///
/// Writes are atomic: data is streamed to a temporary file first, then
/// renamed into place, so a crashed upload never leaves a truncated
/// backup that restores silently short.
pub struct FsObjectStore {
    base_dir: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at the given directory.
    ///
    /// The directory is created if it does not exist.
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self, BackupError> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.base_dir.join(bucket).join(key)
    }
}

#[async_trait::async_trait]
impl ObjectStore for FsObjectStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        _size: i64,
    ) -> Result<u64, BackupError> {
        let path = self.object_path(bucket, key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let bytes = tokio::io::copy(reader, &mut file).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!(path = %path.display(), bytes, "stored backup object");
        Ok(bytes)
    }
}
