//! Connection seams to source, config server, target and checkpoint storage.
//!
//! The coordinator only talks to clusters through these traits. Wire-level
//! driver code, retries and pooling live behind a [`Connector`] implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::chunk_map::{ChunkRecord, ShardedCollection};
use crate::error::Result;
use crate::types::{Document, IndexSpec, Namespace, TimestampNode};

/// Which member of a replica set a connection prefers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectMode {
    /// Primary only.
    Primary,
    /// Secondary when available.
    SecondaryPreferred,
}

/// Read or write concern level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concern {
    /// Server default.
    Default,
    /// Local node acknowledgement.
    Local,
    /// Majority acknowledgement.
    Majority,
}

/// Options for opening a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Member preference.
    pub mode: ConnectMode,
    /// Read concern.
    pub read_concern: Concern,
    /// Write concern.
    pub write_concern: Concern,
    /// Optional CA bundle.
    pub tls_root_ca: Option<PathBuf>,
}

impl ConnectOptions {
    /// Options for reading documents off a source.
    pub fn source_read(tls_root_ca: Option<PathBuf>) -> Self {
        Self {
            mode: ConnectMode::SecondaryPreferred,
            read_concern: Concern::Majority,
            write_concern: Concern::Default,
            tls_root_ca,
        }
    }

    /// Options for writing to the target.
    pub fn target_write(tls_root_ca: Option<PathBuf>) -> Self {
        Self {
            mode: ConnectMode::Primary,
            read_concern: Concern::Local,
            write_concern: Concern::Default,
            tls_root_ca,
        }
    }
}

/// A batch cursor over one namespace.
#[async_trait]
pub trait DocumentCursor: Send {
    /// Next batch of documents, `None` when exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>>;
}

/// Read access to one source member.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// All `database.collection` pairs on the source.
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;

    /// Indexes of one collection.
    async fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexSpec>>;

    /// Oldest and newest operation timestamps.
    async fn sample_timestamps(&self) -> Result<TimestampNode>;

    /// Open a batch cursor over every document of `ns`.
    async fn open_cursor(&self, ns: &Namespace, batch_size: usize)
        -> Result<Box<dyn DocumentCursor>>;
}

/// Metadata queries against a sharded cluster's config server.
#[async_trait]
pub trait ConfigServerClient: Send + Sync {
    /// True while the balancer may be migrating chunks.
    async fn balancer_active(&self) -> Result<bool>;

    /// Key patterns of every sharded collection.
    async fn sharded_collections(&self) -> Result<Vec<ShardedCollection>>;

    /// Every chunk with its owning shard.
    async fn chunks(&self) -> Result<Vec<ChunkRecord>>;
}

/// Write access to the target cluster.
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// True when the target is itself sharded.
    async fn is_sharded(&self) -> Result<bool>;

    /// Drop a collection; dropping a missing collection is not an error.
    async fn drop_collection(&self, ns: &Namespace) -> Result<()>;

    /// Shard a collection with the given key pattern.
    async fn enable_sharding(&self, collection: &ShardedCollection) -> Result<()>;

    /// Create indexes, in background mode when `background` is set.
    async fn create_indexes(&self, ns: &Namespace, indexes: &[IndexSpec], background: bool)
        -> Result<()>;

    /// Insert a batch of documents.
    async fn insert_batch(&self, ns: &Namespace, docs: Vec<Document>) -> Result<()>;
}

/// Opens connections. Implementations own transport, pooling and retries.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to a source member or router.
    async fn source(&self, url: &str, opts: &ConnectOptions) -> Result<Arc<dyn SourceClient>>;

    /// Connect to a config server.
    async fn config_server(&self, url: &str, opts: &ConnectOptions)
        -> Result<Arc<dyn ConfigServerClient>>;

    /// Connect to the target.
    async fn target(&self, url: &str, opts: &ConnectOptions) -> Result<Arc<dyn TargetClient>>;
}
