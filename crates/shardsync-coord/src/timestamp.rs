//! Pre-copy sampling of per-source operation timestamps.

use std::collections::BTreeMap;
use tracing::info;

use crate::client::{ConnectOptions, Connector};
use crate::config::SyncMode;
use crate::error::{Result, SyncError};
use crate::types::{timestamp_parts, Source, TimestampNode};

/// Replica name → timestamps sampled before copy started.
pub type TimestampMap = BTreeMap<String, TimestampNode>;

/// Sample oldest/newest timestamps of every incremental-capable source.
///
/// Returns `None` for full-only runs. Any failure fails the whole run: a
/// missing resume point would silently drop operations during incremental
/// replication.
pub async fn sample_timestamps(
    connector: &dyn Connector,
    sources: &[Source],
    opts: &ConnectOptions,
    mode: SyncMode,
) -> Result<Option<TimestampMap>> {
    if !mode.has_incremental() {
        return Ok(None);
    }
    if sources.is_empty() {
        return Err(SyncError::Timestamp {
            msg: "no source to sample timestamps from".to_string(),
        });
    }

    let mut map = TimestampMap::new();
    for src in sources {
        let node = sample_one(connector, src, opts)
            .await
            .map_err(|e| SyncError::Timestamp {
                msg: format!("fetch timestamp of {} failed: {}", src, e),
            })?;
        if node.oldest > node.newest {
            return Err(SyncError::Timestamp {
                msg: format!(
                    "source {} reports oldest {:?} after newest {:?}",
                    src,
                    timestamp_parts(node.oldest),
                    timestamp_parts(node.newest)
                ),
            });
        }
        info!(
            source = %src,
            oldest = ?timestamp_parts(node.oldest),
            newest = ?timestamp_parts(node.newest),
            "timestamp sampled"
        );
        map.insert(src.replica_name.clone(), node);
    }
    Ok(Some(map))
}

async fn sample_one(
    connector: &dyn Connector,
    src: &Source,
    opts: &ConnectOptions,
) -> Result<TimestampNode> {
    let client = connector.source(&src.url, opts).await?;
    client.sample_timestamps().await
}
