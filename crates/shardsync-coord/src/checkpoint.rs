//! Checkpoint reconciliation and persistence.
//!
//! After every worker succeeded, the per-source timestamps sampled before the
//! copy become the resume points of incremental replication. When several
//! shards feed one logical stream, they collapse into a single entry holding
//! the smallest `newest`, so the resumed stream never skips an operation of
//! the slowest shard.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::timestamp::TimestampMap;
use crate::types::Timestamp;

/// Checkpoint key → resume timestamp.
pub type CheckpointMap = BTreeMap<String, Timestamp>;

/// Turn sampled timestamps into resume points.
///
/// With `merge_into`, every source collapses into one entry under that key
/// with the minimum `newest`.
pub fn reconcile(timestamps: &TimestampMap, merge_into: Option<&str>) -> Result<CheckpointMap> {
    match merge_into {
        None => Ok(timestamps
            .iter()
            .map(|(name, node)| (name.clone(), node.newest))
            .collect()),
        Some(key) => {
            let smallest = timestamps
                .values()
                .map(|node| node.newest)
                .min()
                .ok_or_else(|| SyncError::Timestamp {
                    msg: format!("no source timestamp to merge into {}", key),
                })?;
            Ok(CheckpointMap::from([(key.to_string(), smallest)]))
        }
    }
}

/// Durable storage of the handoff checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist resume points. Called once, only after a fully successful copy.
    async fn persist(&self, checkpoint: &CheckpointMap) -> Result<()>;
}

/// A persisted checkpoint record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Wall-clock time of the write (microseconds since epoch).
    pub written_at_us: u64,
    /// Resume points.
    pub resume: CheckpointMap,
}

impl CheckpointRecord {
    /// Serialize to bincode bytes.
    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from bincode bytes.
    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Stores the checkpoint in a local file, replaced atomically on each write.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Store at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Location of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last persisted record, if any.
    pub async fn load(&self) -> Result<Option<CheckpointRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(CheckpointRecord::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Sibling written before the rename; always distinct from `path`.
    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn persist(&self, checkpoint: &CheckpointMap) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let record = CheckpointRecord {
            written_at_us: current_time_us(),
            resume: checkpoint.clone(),
        };
        let bytes = record.to_bytes()?;

        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SyncError::Checkpoint {
                msg: format!("write {} failed: {}", tmp.display(), e),
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SyncError::Checkpoint {
                msg: format!("rename to {} failed: {}", self.path.display(), e),
            })?;

        info!(path = %self.path.display(), entries = checkpoint.len(), "checkpoint persisted");
        Ok(())
    }
}

fn current_time_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
