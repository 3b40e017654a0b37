//! Per-source full-copy worker.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::client::{SourceClient, TargetClient};
use crate::error::{Result, SyncError};
use crate::orphan::OrphanFilter;
use crate::progress::{ProgressTracker, WorkerStatus};
use crate::qos::Qos;
use crate::types::{Namespace, Source};

/// Documents moved by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Documents written to the target.
    pub docs_copied: u64,
    /// Documents dropped as orphans.
    pub docs_skipped: u64,
    /// Namespaces fully copied.
    pub namespaces: usize,
}

/// Copies every resolved namespace of one source to the target.
pub struct CopyWorker {
    id: usize,
    source: Source,
    source_client: Arc<dyn SourceClient>,
    target: Arc<dyn TargetClient>,
    orphan_filter: Option<OrphanFilter>,
    qos: Arc<Qos>,
    progress: Arc<ProgressTracker>,
    batch_size: usize,
}

impl CopyWorker {
    /// Create a worker. `orphan_filter` is set only for direct shard copies
    /// with filtering enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        source: Source,
        source_client: Arc<dyn SourceClient>,
        target: Arc<dyn TargetClient>,
        orphan_filter: Option<OrphanFilter>,
        qos: Arc<Qos>,
        progress: Arc<ProgressTracker>,
        batch_size: usize,
    ) -> Self {
        Self {
            id,
            source,
            source_client,
            target,
            orphan_filter,
            qos,
            progress,
            batch_size: batch_size.max(1),
        }
    }

    /// Worker index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The source this worker reads.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Copy every namespace, stopping on the first error.
    pub async fn run(self, namespaces: Arc<BTreeSet<Namespace>>) -> Result<CopyStats> {
        self.progress
            .register_worker(self.id, &self.source.replica_name, namespaces.len());
        info!(worker = self.id, source = %self.source, "document syncer start");

        let outcome = self.copy_all(&namespaces).await;
        match &outcome {
            Ok(stats) => {
                self.progress.finish_worker(self.id, WorkerStatus::Done);
                info!(
                    worker = self.id,
                    source = %self.source,
                    docs = stats.docs_copied,
                    skipped = stats.docs_skipped,
                    "document syncer finished"
                );
            }
            Err(e) => {
                self.progress
                    .finish_worker(self.id, WorkerStatus::Failed(e.to_string()));
            }
        }
        outcome.map_err(|e| SyncError::Copy {
            worker: self.id,
            source_url: self.source.masked_url(),
            error: Box::new(e),
        })
    }

    async fn copy_all(&self, namespaces: &BTreeSet<Namespace>) -> Result<CopyStats> {
        let mut stats = CopyStats::default();
        for ns in namespaces {
            self.copy_namespace(ns, &mut stats).await?;
            stats.namespaces += 1;
            self.progress.finish_namespace(self.id);
        }
        Ok(stats)
    }

    async fn copy_namespace(&self, ns: &Namespace, stats: &mut CopyStats) -> Result<()> {
        let ns_name = ns.to_string();
        self.progress.start_namespace(self.id, &ns_name);
        let started = Instant::now();
        let mut copied = 0u64;

        let mut cursor = self.source_client.open_cursor(ns, self.batch_size).await?;
        while let Some(mut batch) = cursor.next_batch().await? {
            let skipped = match &self.orphan_filter {
                Some(filter) => filter.retain_owned(ns, &mut batch),
                None => 0,
            };
            let kept = batch.len() as u64;
            if kept > 0 {
                self.qos.acquire(kept).await;
                self.target.insert_batch(ns, batch).await?;
                self.qos.record(kept);
            }
            copied += kept;
            stats.docs_copied += kept;
            stats.docs_skipped += skipped as u64;
            self.progress.add_docs(self.id, kept, skipped as u64);
        }

        debug!(
            worker = self.id,
            ns = %ns,
            docs = copied,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "namespace copied"
        );
        Ok(())
    }
}
