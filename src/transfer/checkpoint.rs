//! Persistent resume state.
//!
//! One JSON file per `(local path, operation)` pair, named by the blake3 hash
//! of that pair. Records are written after every confirmed range and removed
//! when the transfer completes, so a record that is still present after a
//! failed run marks a resumable transfer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::{Result, TransferError};
use super::request::Direction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub file_path: String,
    pub operation: String,
    /// Bytes confirmed written to local storage
    pub offset: u64,
    pub total_size: u64,
    pub timestamp: DateTime<Utc>,
}

impl CheckpointRecord {
    /// A checkpoint is only usable against an object of the same size
    pub fn matches(&self, total_size: u64) -> bool {
        self.total_size == total_size && self.offset <= self.total_size
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Stable identifier for a `(path, operation)` pair
    pub fn key(local_path: &Path, direction: Direction) -> String {
        let path = normalize(local_path);
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(direction.as_str().as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    fn record_path(&self, local_path: &Path, direction: Direction) -> PathBuf {
        self.dir
            .join(format!("{}.json", Self::key(local_path, direction)))
    }

    pub async fn load(
        &self,
        local_path: &Path,
        direction: Direction,
    ) -> Result<Option<CheckpointRecord>> {
        let path = self.record_path(local_path, direction);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.error(&path, e)),
        };

        match serde_json::from_str::<CheckpointRecord>(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(
                    "Ignoring unreadable checkpoint {} for {}: {}",
                    path.display(),
                    local_path.display(),
                    e
                );
                self.delete(local_path, direction).await?;
                Ok(None)
            }
        }
    }

    pub async fn save(
        &self,
        local_path: &Path,
        direction: Direction,
        offset: u64,
        total_size: u64,
    ) -> Result<()> {
        let path = self.record_path(local_path, direction);
        if offset > total_size {
            return Err(TransferError::Checkpoint {
                path,
                message: format!("offset {} exceeds total size {}", offset, total_size),
            });
        }

        let record = CheckpointRecord {
            file_path: normalize(local_path),
            operation: direction.as_str().to_string(),
            offset,
            total_size,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| TransferError::Checkpoint {
            path: path.clone(),
            message: e.to_string(),
        })?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| self.error(&self.dir, e))?;
        // Write-then-rename so a crash never leaves a half-written record
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| self.error(&path, e))?;

        debug!(
            "Checkpoint {} {}: {}/{}",
            direction,
            local_path.display(),
            offset,
            total_size
        );
        Ok(())
    }

    pub async fn delete(&self, local_path: &Path, direction: Direction) -> Result<()> {
        let path = self.record_path(local_path, direction);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.error(&path, e)),
        }
    }

    fn error(&self, path: &Path, e: std::io::Error) -> TransferError {
        TransferError::Checkpoint {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    }
}

fn normalize(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_is_stable_and_distinct() {
        let a = CheckpointStore::key(Path::new("/data/file.bin"), Direction::Download);
        let b = CheckpointStore::key(Path::new("/data/file.bin"), Direction::Download);
        let c = CheckpointStore::key(Path::new("/data/file.bin"), Direction::Upload);
        let d = CheckpointStore::key(Path::new("/data/other.bin"), Direction::Download);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cache"));
        let file = dir.path().join("out.bin");

        assert!(store.load(&file, Direction::Download).await.unwrap().is_none());

        store.save(&file, Direction::Download, 1024, 4096).await.unwrap();
        let record = store
            .load(&file, Direction::Download)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.offset, 1024);
        assert_eq!(record.total_size, 4096);
        assert_eq!(record.operation, "download");
        assert!(record.matches(4096));
        assert!(!record.matches(4097));

        // Different operation, different record
        assert!(store.load(&file, Direction::Upload).await.unwrap().is_none());

        store.delete(&file, Direction::Download).await.unwrap();
        assert!(store.load(&file, Direction::Download).await.unwrap().is_none());
        // Deleting twice is fine
        store.delete(&file, Direction::Download).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_rejects_offset_past_total() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let result = store
            .save(Path::new("x.bin"), Direction::Download, 11, 10)
            .await;
        assert!(matches!(result, Err(TransferError::Checkpoint { .. })));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_dropped() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path());
        let file = Path::new("broken.bin");
        let key = CheckpointStore::key(file, Direction::Download);
        std::fs::write(dir.path().join(format!("{}.json", key)), "{not json").unwrap();

        assert!(store.load(file, Direction::Download).await.unwrap().is_none());
        assert!(!dir.path().join(format!("{}.json", key)).exists());
    }
}
