//! Top-level full-sync orchestration.
//!
//! A run is a linear phase machine:
//! `DetectTopology → FetchChunkMap → ResolveNamespaces → SampleCheckpointTimestamps
//! → PrepareTarget → ParallelCopy → Join → ReconcileCheckpoint → ForegroundIndex → Done`.
//! Any phase failure ends the run; nothing is retried at this layer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{reconcile, CheckpointMap, CheckpointStore};
use crate::chunk_map::{fetch_chunk_map, ChunkMapRequest, DbChunkMap, ShardingChunkMap};
use crate::client::{ConnectOptions, Connector, TargetClient};
use crate::config::{IndexCreation, SyncConfig};
use crate::error::{Result, SyncError};
use crate::extra_job::{
    abort_process, ExtraJobScheduler, FatalHandler, JobRegistry, JobSpec,
    NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB,
};
use crate::monitor::{self, MonitorState};
use crate::namespace::{resolve_namespaces, NamespaceFilter};
use crate::orphan::OrphanFilter;
use crate::progress::ProgressTracker;
use crate::qos::Qos;
use crate::timestamp::{sample_timestamps, TimestampMap};
use crate::topology::{SourceKind, Topology};
use crate::types::{IndexSpec, Namespace, Source};
use crate::worker::{CopyStats, CopyWorker};

/// Phases of a full-sync run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    /// Work out which sources exist and how they are read.
    DetectTopology,
    /// Read the chunk distribution (sharded direct sources only).
    FetchChunkMap,
    /// Compute the namespaces to copy.
    ResolveNamespaces,
    /// Sample resume timestamps before any document moves.
    SampleCheckpointTimestamps,
    /// Drop, shard and pre-index target collections.
    PrepareTarget,
    /// One copy worker per source.
    ParallelCopy,
    /// Wait for every worker.
    Join,
    /// Merge and persist the handoff checkpoint.
    ReconcileCheckpoint,
    /// Create indexes after the copy.
    ForegroundIndex,
    /// Run finished.
    Done,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct FullSyncOutcome {
    /// Shape of the source.
    pub source_kind: SourceKind,
    /// Namespaces copied.
    pub namespaces: BTreeSet<Namespace>,
    /// Chunk map used for orphan filtering (empty when unused).
    pub chunk_map: ShardingChunkMap,
    /// Persisted checkpoint, `None` for full-only runs.
    pub checkpoint: Option<CheckpointMap>,
    /// Per-worker statistics, by worker index.
    pub worker_stats: Vec<CopyStats>,
    /// Extra-job tasks, still running; stopped through the run's cancel token.
    pub extra_jobs: Vec<JoinHandle<()>>,
}

/// Drives one full-sync run.
pub struct ReplicationCoordinator {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    progress: Arc<ProgressTracker>,
    job_registry: JobRegistry,
    on_fatal: FatalHandler,
}

impl ReplicationCoordinator {
    /// Create a coordinator with the built-in extra jobs and the process-abort
    /// fatal handler.
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            config,
            connector,
            checkpoint_store,
            progress: Arc::new(ProgressTracker::new()),
            job_registry: JobRegistry::with_builtin_jobs(),
            on_fatal: abort_process(),
        }
    }

    /// Replace the extra-job registry.
    pub fn with_job_registry(mut self, registry: JobRegistry) -> Self {
        self.job_registry = registry;
        self
    }

    /// Replace the handler invoked on extra-job violations.
    pub fn with_fatal_handler(mut self, on_fatal: FatalHandler) -> Self {
        self.on_fatal = on_fatal;
        self
    }

    /// Shared progress of this run.
    pub fn progress(&self) -> Arc<ProgressTracker> {
        self.progress.clone()
    }

    fn enter(&self, phase: SyncPhase) {
        info!(phase = %phase, "full sync phase");
        self.progress.set_phase(phase);
    }

    fn source_opts(&self) -> ConnectOptions {
        ConnectOptions::source_read(self.config.source_tls_root_ca.clone())
    }

    /// Run the full sync. Extra jobs keep running after a successful return
    /// until `cancel` fires; on failure they are stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<FullSyncOutcome> {
        self.enter(SyncPhase::DetectTopology);
        let topology = self
            .config
            .validate()
            .and_then(|_| Topology::detect(&self.config))
            .map_err(|e| e.in_phase(SyncPhase::DetectTopology))?;
        info!(
            kind = %topology.kind(),
            full_sources = topology.real_source_full_sync().len(),
            "source topology detected"
        );

        let jobs_cancel = cancel.child_token();
        let scheduler = self.build_scheduler(&topology)?;
        let extra_jobs = scheduler.start(jobs_cancel.clone());

        let qos = Arc::new(Qos::new(
            self.config.full_sync.qps_limit,
            self.config.full_sync.reader_document_batch_size as u64,
        ));

        let monitor_cancel = cancel.child_token();
        let monitor = match self.config.full_sync.http_listen_port {
            Some(port) => {
                let state = MonitorState {
                    progress: self.progress.clone(),
                    qos: qos.clone(),
                };
                match monitor::spawn(
                    SocketAddr::from(([0, 0, 0, 0], port)),
                    state,
                    monitor_cancel.clone(),
                )
                .await
                {
                    Ok((_, handle)) => Some(handle),
                    Err(e) => {
                        error!(port, error = %e, "start full sync monitor failed");
                        None
                    }
                }
            }
            None => None,
        };

        let result = self.run_full_sync(&topology, qos).await;

        monitor_cancel.cancel();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }

        match result {
            Ok(mut outcome) => {
                outcome.extra_jobs = extra_jobs;
                self.enter(SyncPhase::Done);
                info!("document syncer sync end");
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "full sync failed");
                jobs_cancel.cancel();
                for handle in extra_jobs {
                    let _ = handle.await;
                }
                Err(e)
            }
        }
    }

    fn build_scheduler(&self, topology: &Topology) -> Result<ExtraJobScheduler> {
        let scheduler = ExtraJobScheduler::new(
            self.job_registry.clone(),
            self.connector.clone(),
            self.on_fatal.clone(),
        );
        if self.config.sync_mode.has_incremental()
            && !self.config.shard_by_object_id_whitelist.is_empty()
        {
            let spec = JobSpec {
                interval: std::time::Duration::from_secs(self.config.extra_job_interval_secs),
                namespaces: self
                    .config
                    .shard_by_object_id_whitelist
                    .iter()
                    .map(|ns| Namespace::parse(ns))
                    .collect(),
                sources: topology.real_source_incr_sync().to_vec(),
                tls_root_ca: self.config.source_tls_root_ca.clone(),
            };
            scheduler
                .add_job(NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB, spec)
                .map_err(|e| e.in_phase(SyncPhase::DetectTopology))?;
        }
        Ok(scheduler)
    }

    async fn run_full_sync(&self, topology: &Topology, qos: Arc<Qos>) -> Result<FullSyncOutcome> {
        let opts = self.source_opts();

        // Chunk map
        self.enter(SyncPhase::FetchChunkMap);
        let chunk_map = if topology.is_sharding && !topology.via_router() {
            info!("source is sharded and read off shards, fetching chunk map");
            fetch_chunk_map(
                self.connector.as_ref(),
                self.config.mongo_cs_url.as_deref(),
                &opts,
                ChunkMapRequest {
                    is_sharding: topology.is_sharding,
                    via_router: topology.via_router(),
                    fetch_method: topology.fetch_method,
                    filter_orphan: self.config.full_sync.filter_orphan_document,
                },
            )
            .await
            .map_err(|e| e.in_phase(SyncPhase::FetchChunkMap))?
        } else {
            info!("source is a replica set or read through a router, no chunk map needed");
            ShardingChunkMap::new()
        };

        // Namespaces
        self.enter(SyncPhase::ResolveNamespaces);
        let filter = NamespaceFilter::from_config(&self.config.filter)
            .map_err(|e| e.in_phase(SyncPhase::ResolveNamespaces))?;
        let namespaces = resolve_namespaces(
            self.connector.as_ref(),
            topology.real_source_full_sync(),
            &opts,
            &filter,
        )
        .await
        .map_err(|e| e.in_phase(SyncPhase::ResolveNamespaces))?;

        // Timestamps, strictly before any document is read
        self.enter(SyncPhase::SampleCheckpointTimestamps);
        let timestamp_sources = if topology.mongo_d.is_empty() {
            topology.real_source_incr_sync()
        } else {
            &topology.mongo_d[..]
        };
        let timestamps = sample_timestamps(
            self.connector.as_ref(),
            timestamp_sources,
            &opts,
            self.config.sync_mode,
        )
        .await
        .map_err(|e| e.in_phase(SyncPhase::SampleCheckpointTimestamps))?;

        // Target
        self.enter(SyncPhase::PrepareTarget);
        let (target, indexes) = self
            .prepare_target(topology, &namespaces)
            .await
            .map_err(|e| e.in_phase(SyncPhase::PrepareTarget))?;

        // Copy
        self.enter(SyncPhase::ParallelCopy);
        let handles = self.spawn_workers(topology, &chunk_map, &namespaces, target.clone(), qos);

        let results = await_workers(handles).await;

        self.enter(SyncPhase::Join);
        let worker_stats = first_failure(results).map_err(|e| e.in_phase(SyncPhase::Join))?;

        // Checkpoint, only after every worker succeeded
        self.enter(SyncPhase::ReconcileCheckpoint);
        let checkpoint = match &timestamps {
            Some(ts) => Some(
                self.persist_checkpoint(topology, ts)
                    .await
                    .map_err(|e| e.in_phase(SyncPhase::ReconcileCheckpoint))?,
            ),
            None => None,
        };

        if self.config.full_sync.create_index == IndexCreation::Foreground {
            self.enter(SyncPhase::ForegroundIndex);
            create_indexes(target.as_ref(), &indexes, false)
                .await
                .map_err(|e| e.in_phase(SyncPhase::ForegroundIndex))?;
        }

        Ok(FullSyncOutcome {
            source_kind: topology.kind(),
            namespaces,
            chunk_map,
            checkpoint,
            worker_stats,
            extra_jobs: Vec::new(),
        })
    }

    async fn prepare_target(
        &self,
        topology: &Topology,
        namespaces: &BTreeSet<Namespace>,
    ) -> Result<(Arc<dyn TargetClient>, BTreeMap<Namespace, Vec<IndexSpec>>)> {
        let target_url = self.config.target_url()?;
        let target = self
            .connector
            .target(
                target_url,
                &ConnectOptions::target_write(self.config.target_tls_root_ca.clone()),
            )
            .await?;

        if self.config.full_sync.collection_exist_drop {
            for ns in namespaces {
                warn!(ns = %ns, "dropping target collection");
                target.drop_collection(ns).await?;
            }
        }

        if topology.is_sharding && target.is_sharded().await? {
            self.sync_sharding_spec(target.as_ref(), namespaces).await?;
        }

        let mut indexes = BTreeMap::new();
        if self.config.full_sync.create_index != IndexCreation::None {
            indexes = self.fetch_indexes(topology, namespaces).await?;
            for (ns, list) in &indexes {
                let names: Vec<&str> = list.iter().map(|i| i.name.as_str()).collect();
                info!(ns = %ns, indexes = ?names, "source indexes");
            }
            if self.config.full_sync.create_index == IndexCreation::Background {
                create_indexes(target.as_ref(), &indexes, true).await?;
            }
        }
        Ok((target, indexes))
    }

    async fn sync_sharding_spec(
        &self,
        target: &dyn TargetClient,
        namespaces: &BTreeSet<Namespace>,
    ) -> Result<()> {
        let url = self
            .config
            .mongo_s_url
            .as_deref()
            .or(self.config.mongo_cs_url.as_deref())
            .ok_or_else(|| SyncError::Config {
                msg: "sharding to sharding sync needs mongo_s_url or mongo_cs_url".to_string(),
            })?;
        let url = Source::parse(url, 0).url;
        let cs = self.connector.config_server(&url, &self.source_opts()).await?;
        for coll in cs.sharded_collections().await? {
            if namespaces.contains(&coll.ns) {
                info!(ns = %coll.ns, key = ?coll.key_fields, "enable sharding on target");
                target.enable_sharding(&coll).await?;
            }
        }
        Ok(())
    }

    async fn fetch_indexes(
        &self,
        topology: &Topology,
        namespaces: &BTreeSet<Namespace>,
    ) -> Result<BTreeMap<Namespace, Vec<IndexSpec>>> {
        let mut indexes: BTreeMap<Namespace, Vec<IndexSpec>> = BTreeMap::new();
        for src in topology.real_source_full_sync() {
            let client = self.connector.source(&src.url, &self.source_opts()).await?;
            for ns in namespaces {
                let entry = indexes.entry(ns.clone()).or_default();
                for index in client.list_indexes(ns).await? {
                    if !entry.iter().any(|i| i.name == index.name) {
                        entry.push(index);
                    }
                }
            }
        }
        Ok(indexes)
    }

    fn spawn_workers(
        &self,
        topology: &Topology,
        chunk_map: &ShardingChunkMap,
        namespaces: &BTreeSet<Namespace>,
        target: Arc<dyn TargetClient>,
        qos: Arc<Qos>,
    ) -> Vec<(usize, Source, JoinHandle<Result<CopyStats>>)> {
        let namespaces = Arc::new(namespaces.clone());
        let filtering = self.config.full_sync.filter_orphan_document && !chunk_map.is_empty();

        topology
            .real_source_full_sync()
            .iter()
            .enumerate()
            .map(|(i, src)| {
                let orphan_filter = filtering.then(|| {
                    let slice = chunk_map.get(&src.replica_name).cloned().unwrap_or_else(|| {
                        warn!(source = %src, "document syncer has no chunk map");
                        DbChunkMap::new()
                    });
                    OrphanFilter::new(src.replica_name.clone(), slice)
                });

                let connector = self.connector.clone();
                let opts = self.source_opts();
                let target = target.clone();
                let qos = qos.clone();
                let progress = self.progress.clone();
                let namespaces = namespaces.clone();
                let batch_size = self.config.full_sync.reader_document_batch_size;
                let source = src.clone();
                info!(worker = i, source = %src, "document syncer do replication");

                let handle = tokio::spawn(async move {
                    let client = connector
                        .source(&source.url, &opts)
                        .await
                        .map_err(|e| SyncError::Copy {
                            worker: i,
                            source_url: source.masked_url(),
                            error: Box::new(e),
                        })?;
                    CopyWorker::new(
                        i,
                        source,
                        client,
                        target,
                        orphan_filter,
                        qos,
                        progress,
                        batch_size,
                    )
                    .run(namespaces)
                    .await
                });
                (i, src.clone(), handle)
            })
            .collect()
    }

    async fn persist_checkpoint(
        &self,
        topology: &Topology,
        timestamps: &TimestampMap,
    ) -> Result<CheckpointMap> {
        let merge_into = if topology.merges_checkpoint() {
            topology.mongo_s.as_ref().map(|s| s.replica_name.as_str())
        } else {
            None
        };
        let checkpoint = reconcile(timestamps, merge_into)?;
        info!(checkpoint = ?checkpoint, "try to set checkpoint");
        self.checkpoint_store
            .persist(&checkpoint)
            .await
            .map_err(|e| match e {
                SyncError::Checkpoint { .. } => e,
                other => SyncError::Checkpoint {
                    msg: other.to_string(),
                },
            })?;
        Ok(checkpoint)
    }
}

type WorkerResult = (usize, Source, Result<CopyStats>);

/// Wait for every worker, in index order.
async fn await_workers(
    handles: Vec<(usize, Source, JoinHandle<Result<CopyStats>>)>,
) -> Vec<WorkerResult> {
    let mut results = Vec::with_capacity(handles.len());
    for (i, src, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(SyncError::Copy {
                worker: i,
                source_url: src.masked_url(),
                error: Box::new(SyncError::Source {
                    msg: format!("worker task aborted: {}", join_err),
                }),
            }),
        };
        results.push((i, src, result));
    }
    results
}

/// Every worker's stats, or the error of the lowest failing worker index.
fn first_failure(results: Vec<WorkerResult>) -> Result<Vec<CopyStats>> {
    let mut stats = Vec::with_capacity(results.len());
    let mut first_error: Option<SyncError> = None;
    for (i, src, result) in results {
        match result {
            Ok(s) => stats.push(s),
            Err(e) => {
                error!(worker = i, source = %src, error = %e, "document replication failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(stats),
    }
}

async fn create_indexes(
    target: &dyn TargetClient,
    indexes: &BTreeMap<Namespace, Vec<IndexSpec>>,
    background: bool,
) -> Result<()> {
    for (ns, list) in indexes {
        if list.is_empty() {
            continue;
        }
        target
            .create_indexes(ns, list, background)
            .await
            .map_err(|e| SyncError::Target {
                msg: format!(
                    "create {} index on {} failed: {}",
                    if background { "background" } else { "foreground" },
                    ns,
                    e
                ),
            })?;
    }
    Ok(())
}
