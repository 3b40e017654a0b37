//! In-memory cluster fake shared by the integration tests.
//!
//! One `FakeCluster` holds every source member, the config server and the
//! target. Every observable operation is appended to an event log so tests can
//! assert ordering (timestamps before copy, indexes before or after inserts).

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use shardsync_coord::checkpoint::{CheckpointMap, CheckpointStore};
use shardsync_coord::chunk_map::{ChunkRecord, ShardedCollection};
use shardsync_coord::client::{
    ConfigServerClient, ConnectOptions, Connector, DocumentCursor, SourceClient, TargetClient,
};
use shardsync_coord::config::{FetchMethod, SyncConfig, SyncMode};
use shardsync_coord::error::{Result, SyncError};
use shardsync_coord::types::{Document, IndexSpec, Namespace, TimestampNode};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

pub const TARGET_URL: &str = "mongodb://target:27017";
pub const CS_URL: &str = "mongodb://cs:27019";
pub const ROUTER_URL: &str = "mongodb://router:27017";

pub fn doc(v: Value) -> Document {
    v.as_object().cloned().expect("object literal")
}

pub fn user(uid: i64) -> Document {
    doc(json!({ "_id": uid, "uid": uid, "name": format!("user-{}", uid) }))
}

pub fn shard_url(name: &str) -> String {
    format!("mongodb://{}:27018", name)
}

#[derive(Debug, Default)]
struct SourceState {
    namespaces: BTreeMap<Namespace, Vec<Document>>,
    indexes: BTreeMap<Namespace, Vec<IndexSpec>>,
    timestamps: TimestampNode,
    failing_cursor: BTreeSet<Namespace>,
    failing_indexes: bool,
}

#[derive(Debug, Default)]
struct TargetState {
    sharded: bool,
    docs: BTreeMap<Namespace, Vec<Document>>,
    indexes: BTreeMap<Namespace, Vec<(String, bool)>>,
    sharded_collections: Vec<Namespace>,
    failing_insert: bool,
    insert_gate: Option<Arc<Semaphore>>,
    inserts_waiting: usize,
}

#[derive(Debug, Default)]
struct ClusterState {
    sources: BTreeMap<String, SourceState>,
    unreachable: HashSet<String>,
    balancer_active: bool,
    collections: Vec<ShardedCollection>,
    chunks: Vec<ChunkRecord>,
    target: TargetState,
    events: Vec<String>,
}

/// Shared handle; clones see the same cluster.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            state: self.state.clone(),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_source(&self, url: &str, oldest: i64, newest: i64) {
        self.with(|s| {
            s.sources.entry(url.to_string()).or_default().timestamps =
                TimestampNode { oldest, newest };
        });
    }

    pub fn insert_docs(&self, url: &str, ns: &str, docs: Vec<Document>) {
        self.with(|s| {
            s.sources
                .entry(url.to_string())
                .or_default()
                .namespaces
                .entry(Namespace::parse(ns))
                .or_default()
                .extend(docs);
        });
    }

    pub fn add_index(&self, url: &str, ns: &str, index: IndexSpec) {
        self.with(|s| {
            s.sources
                .entry(url.to_string())
                .or_default()
                .indexes
                .entry(Namespace::parse(ns))
                .or_default()
                .push(index);
        });
    }

    pub fn fail_cursor(&self, url: &str, ns: &str) {
        self.with(|s| {
            s.sources
                .entry(url.to_string())
                .or_default()
                .failing_cursor
                .insert(Namespace::parse(ns));
        });
    }

    pub fn fail_index_listing(&self, url: &str) {
        self.with(|s| s.sources.entry(url.to_string()).or_default().failing_indexes = true);
    }

    pub fn set_unreachable(&self, url: &str) {
        self.with(|s| s.unreachable.insert(url.to_string()));
    }

    pub fn set_balancer_active(&self, active: bool) {
        self.with(|s| s.balancer_active = active);
    }

    pub fn shard_collection(&self, ns: &str, key_fields: &[&str], hashed: bool) {
        self.with(|s| {
            s.collections.push(ShardedCollection {
                ns: Namespace::parse(ns),
                key_fields: key_fields.iter().map(|f| f.to_string()).collect(),
                hashed,
            })
        });
    }

    pub fn add_chunk(&self, ns: &str, shard: &str, min: Value, max: Value) {
        self.with(|s| {
            s.chunks.push(ChunkRecord {
                ns: Namespace::parse(ns),
                shard: shard.to_string(),
                min: doc(min),
                max: doc(max),
            })
        });
    }

    pub fn set_target_sharded(&self, sharded: bool) {
        self.with(|s| s.target.sharded = sharded);
    }

    pub fn fail_target_insert(&self) {
        self.with(|s| s.target.failing_insert = true);
    }

    /// Block every insert until permits are added to the returned gate.
    pub fn hold_inserts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        self.with(|s| s.target.insert_gate = Some(gate.clone()));
        gate
    }

    /// Inserts that reached the gate so far.
    pub fn inserts_waiting(&self) -> usize {
        self.with(|s| s.target.inserts_waiting)
    }

    pub fn seed_target(&self, ns: &str, docs: Vec<Document>) {
        self.with(|s| {
            s.target
                .docs
                .entry(Namespace::parse(ns))
                .or_default()
                .extend(docs)
        });
    }

    pub fn target_docs(&self, ns: &str) -> Vec<Document> {
        self.with(|s| {
            s.target
                .docs
                .get(&Namespace::parse(ns))
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn target_uids(&self, ns: &str) -> Vec<i64> {
        let mut uids: Vec<i64> = self
            .target_docs(ns)
            .iter()
            .filter_map(|d| d.get("uid").and_then(Value::as_i64))
            .collect();
        uids.sort_unstable();
        uids
    }

    pub fn target_indexes(&self, ns: &str) -> Vec<(String, bool)> {
        self.with(|s| {
            s.target
                .indexes
                .get(&Namespace::parse(ns))
                .cloned()
                .unwrap_or_default()
        })
    }

    pub fn target_sharded_collections(&self) -> Vec<Namespace> {
        self.with(|s| s.target.sharded_collections.clone())
    }

    pub fn events(&self) -> Vec<String> {
        self.with(|s| s.events.clone())
    }

    /// Position of the first event starting with `prefix`.
    pub fn first_event(&self, prefix: &str) -> Option<usize> {
        self.events().iter().position(|e| e.starts_with(prefix))
    }

    /// Position of the last event starting with `prefix`.
    pub fn last_event(&self, prefix: &str) -> Option<usize> {
        self.events().iter().rposition(|e| e.starts_with(prefix))
    }
}

struct FakeConnector {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeConnector {
    fn check_reachable(&self, url: &str) -> Result<()> {
        if self.state.lock().unwrap().unreachable.contains(url) {
            return Err(SyncError::Connect {
                url: url.to_string(),
                msg: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn source(&self, url: &str, _: &ConnectOptions) -> Result<Arc<dyn SourceClient>> {
        self.check_reachable(url)?;
        if !self.state.lock().unwrap().sources.contains_key(url) {
            return Err(SyncError::Connect {
                url: url.to_string(),
                msg: "no such host".to_string(),
            });
        }
        Ok(Arc::new(FakeSource {
            url: url.to_string(),
            state: self.state.clone(),
        }))
    }

    async fn config_server(
        &self,
        url: &str,
        _: &ConnectOptions,
    ) -> Result<Arc<dyn ConfigServerClient>> {
        if !url.starts_with("mongodb://") {
            return Err(SyncError::Connect {
                url: url.to_string(),
                msg: "invalid connection string".to_string(),
            });
        }
        self.check_reachable(url)?;
        Ok(Arc::new(FakeConfigServer {
            state: self.state.clone(),
        }))
    }

    async fn target(&self, url: &str, _: &ConnectOptions) -> Result<Arc<dyn TargetClient>> {
        self.check_reachable(url)?;
        Ok(Arc::new(FakeTarget {
            state: self.state.clone(),
        }))
    }
}

struct FakeSource {
    url: String,
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl SourceClient for FakeSource {
    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let s = self.state.lock().unwrap();
        Ok(s.sources[&self.url].namespaces.keys().cloned().collect())
    }

    async fn list_indexes(&self, ns: &Namespace) -> Result<Vec<IndexSpec>> {
        let s = self.state.lock().unwrap();
        let src = &s.sources[&self.url];
        if src.failing_indexes {
            return Err(SyncError::Source {
                msg: "listIndexes failed".to_string(),
            });
        }
        Ok(src.indexes.get(ns).cloned().unwrap_or_default())
    }

    async fn sample_timestamps(&self) -> Result<TimestampNode> {
        let mut s = self.state.lock().unwrap();
        s.events.push(format!("sample {}", self.url));
        Ok(s.sources[&self.url].timestamps)
    }

    async fn open_cursor(
        &self,
        ns: &Namespace,
        batch_size: usize,
    ) -> Result<Box<dyn DocumentCursor>> {
        let s = self.state.lock().unwrap();
        let src = &s.sources[&self.url];
        let docs = src.namespaces.get(ns).cloned().unwrap_or_default();
        let batches: VecDeque<Vec<Document>> =
            docs.chunks(batch_size).map(|c| c.to_vec()).collect();
        Ok(Box::new(FakeCursor {
            batches,
            fail: src.failing_cursor.contains(ns),
        }))
    }
}

struct FakeCursor {
    batches: VecDeque<Vec<Document>>,
    fail: bool,
}

#[async_trait]
impl DocumentCursor for FakeCursor {
    async fn next_batch(&mut self) -> Result<Option<Vec<Document>>> {
        if self.fail {
            return Err(SyncError::Source {
                msg: "cursor killed".to_string(),
            });
        }
        Ok(self.batches.pop_front())
    }
}

struct FakeConfigServer {
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl ConfigServerClient for FakeConfigServer {
    async fn balancer_active(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().balancer_active)
    }

    async fn sharded_collections(&self) -> Result<Vec<ShardedCollection>> {
        Ok(self.state.lock().unwrap().collections.clone())
    }

    async fn chunks(&self) -> Result<Vec<ChunkRecord>> {
        Ok(self.state.lock().unwrap().chunks.clone())
    }
}

struct FakeTarget {
    state: Arc<Mutex<ClusterState>>,
}

#[async_trait]
impl TargetClient for FakeTarget {
    async fn is_sharded(&self) -> Result<bool> {
        Ok(self.state.lock().unwrap().target.sharded)
    }

    async fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.target.docs.remove(ns);
        s.target.indexes.remove(ns);
        s.events.push(format!("drop {}", ns));
        Ok(())
    }

    async fn enable_sharding(&self, collection: &ShardedCollection) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.target.sharded_collections.push(collection.ns.clone());
        s.events.push(format!("shard {}", collection.ns));
        Ok(())
    }

    async fn create_indexes(
        &self,
        ns: &Namespace,
        indexes: &[IndexSpec],
        background: bool,
    ) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        let entry = s.target.indexes.entry(ns.clone()).or_default();
        for index in indexes {
            entry.push((index.name.clone(), background));
        }
        let mode = if background { "background" } else { "foreground" };
        s.events.push(format!("index {} {}", mode, ns));
        Ok(())
    }

    async fn insert_batch(&self, ns: &Namespace, docs: Vec<Document>) -> Result<()> {
        let gate = {
            let mut s = self.state.lock().unwrap();
            let gate = s.target.insert_gate.clone();
            if gate.is_some() {
                s.target.inserts_waiting += 1;
            }
            gate
        };
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.map_err(|e| SyncError::Target {
                msg: e.to_string(),
            })?;
        }

        let mut s = self.state.lock().unwrap();
        if s.target.failing_insert {
            return Err(SyncError::Target {
                msg: "insert rejected".to_string(),
            });
        }
        s.events.push(format!("insert {} {}", ns, docs.len()));
        s.target.docs.entry(ns.clone()).or_default().extend(docs);
        Ok(())
    }
}

/// Records every persisted checkpoint.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    saved: Mutex<Vec<CheckpointMap>>,
}

impl MemoryCheckpointStore {
    pub fn saved(&self) -> Vec<CheckpointMap> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn persist(&self, checkpoint: &CheckpointMap) -> Result<()> {
        self.saved.lock().unwrap().push(checkpoint.clone());
        Ok(())
    }
}

/// A single replica set `rs0`.
pub fn replica_set_config() -> SyncConfig {
    SyncConfig {
        sync_mode: SyncMode::All,
        mongo_urls: vec![format!("rs0@{}", shard_url("rs0"))],
        tunnel_address: vec![TARGET_URL.to_string()],
        ..Default::default()
    }
}

/// Shards copied directly, chunk metadata on the config server.
pub fn sharded_config(shards: &[&str]) -> SyncConfig {
    SyncConfig {
        sync_mode: SyncMode::All,
        mongo_urls: shards
            .iter()
            .map(|name| format!("{}@{}", name, shard_url(name)))
            .collect(),
        mongo_cs_url: Some(CS_URL.to_string()),
        tunnel_address: vec![TARGET_URL.to_string()],
        incr_fetch_method: FetchMethod::Oplog,
        ..Default::default()
    }
}

/// Shards behind a router, incremental through change streams.
pub fn router_config(shards: &[&str]) -> SyncConfig {
    SyncConfig {
        mongo_s_url: Some(ROUTER_URL.to_string()),
        incr_fetch_method: FetchMethod::ChangeStream,
        ..sharded_config(shards)
    }
}

/// Two shards owning `app.users` by `uid`: sh0 below 100, sh1 from 100 up.
pub fn two_shard_cluster() -> FakeCluster {
    let cluster = FakeCluster::new();
    cluster.add_source(&shard_url("sh0"), 10, 100);
    cluster.add_source(&shard_url("sh1"), 20, 90);
    cluster.shard_collection("app.users", &["uid"], false);
    cluster.add_chunk(
        "app.users",
        "sh0",
        json!({"uid": {"$minKey": 1}}),
        json!({"uid": 100}),
    );
    cluster.add_chunk(
        "app.users",
        "sh1",
        json!({"uid": 100}),
        json!({"uid": {"$maxKey": 1}}),
    );
    // 150 and 20 are orphans left behind by a migration.
    cluster.insert_docs(&shard_url("sh0"), "app.users", vec![user(1), user(50), user(150)]);
    cluster.insert_docs(&shard_url("sh1"), "app.users", vec![user(100), user(200), user(20)]);
    cluster
}
