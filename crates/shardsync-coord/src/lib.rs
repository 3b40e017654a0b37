#![warn(missing_docs)]

//! ShardSync full-sync coordinator: parallel per-shard copy, chunk-map orphan
//! filtering, checkpoint handoff to incremental replication and background
//! verification jobs.

pub mod checkpoint;
pub mod chunk_map;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod extra_job;
pub mod monitor;
pub mod namespace;
pub mod orphan;
pub mod progress;
pub mod qos;
pub mod telemetry;
pub mod timestamp;
pub mod topology;
pub mod types;
pub mod worker;

pub use checkpoint::{CheckpointMap, CheckpointStore, FileCheckpointStore};
pub use client::{ConnectOptions, Connector};
pub use config::SyncConfig;
pub use coordinator::{FullSyncOutcome, ReplicationCoordinator, SyncPhase};
pub use error::{Result, SyncError};
pub use extra_job::{ExtraJob, ExtraJobScheduler, JobRegistry};
pub use topology::Topology;
pub use types::{Document, Namespace, Source};
