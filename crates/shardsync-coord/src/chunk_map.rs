//! Chunk distribution of a sharded source.
//!
//! When documents are copied straight off shard primaries, each shard may still
//! hold documents of chunks that were migrated away (orphans). The chunk map
//! read from the config server tells every shard which key ranges it owns.
//! It is only valid while no chunk moves, so it is built after confirming the
//! balancer is stopped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::client::{ConnectOptions, Connector};
use crate::config::FetchMethod;
use crate::error::{Result, SyncError};
use crate::types::{mask_url_password, Document, Namespace, Source};

/// A single shard-key field value with the store's cross-type ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    /// Lower bound of every key.
    MinKey,
    /// Missing field or explicit null.
    Null,
    /// Integral number.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    Str(String),
    /// Embedded document, fields in stored order.
    Object(Vec<(String, KeyValue)>),
    /// Array.
    Array(Vec<KeyValue>),
    /// Boolean.
    Bool(bool),
    /// Upper bound of every key.
    MaxKey,
}

impl KeyValue {
    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => 0,
            KeyValue::Null => 1,
            KeyValue::Int(_) | KeyValue::Float(_) => 2,
            KeyValue::Str(_) => 3,
            KeyValue::Object(_) => 4,
            KeyValue::Array(_) => 5,
            KeyValue::Bool(_) => 6,
            KeyValue::MaxKey => 7,
        }
    }
}

/// NaN sorts below every other number and equal to itself.
fn cmp_floats(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Exact comparison without rounding the integer through `f64`.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63, the first float above i64::MAX.
    const I64_END: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return Ordering::Greater;
    }
    if f >= I64_END {
        return Ordering::Less;
    }
    if f < -I64_END {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

impl From<&Value> for KeyValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyValue::Null,
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => KeyValue::Int(i),
                None => KeyValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => KeyValue::Str(s.clone()),
            Value::Array(items) => KeyValue::Array(items.iter().map(KeyValue::from).collect()),
            Value::Object(map) => {
                // Extended JSON bounds.
                if map.len() == 1 {
                    if map.contains_key("$minKey") {
                        return KeyValue::MinKey;
                    }
                    if map.contains_key("$maxKey") {
                        return KeyValue::MaxKey;
                    }
                }
                KeyValue::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), KeyValue::from(v)))
                        .collect(),
                )
            }
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Float(a), KeyValue::Float(b)) => cmp_floats(*a, *b),
            (KeyValue::Int(a), KeyValue::Float(b)) => cmp_int_float(*a, *b),
            (KeyValue::Float(a), KeyValue::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            (KeyValue::Object(a), KeyValue::Object(b)) => a.cmp(b),
            (KeyValue::Array(a), KeyValue::Array(b)) => a.cmp(b),
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

/// A possibly compound shard-key value, compared field by field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey(pub Vec<KeyValue>);

impl ShardKey {
    /// Extract the key of `doc` for the given key fields. Dotted fields reach
    /// into embedded documents; missing fields read as `Null`.
    pub fn from_document(doc: &Document, fields: &[String]) -> Self {
        ShardKey(
            fields
                .iter()
                .map(|field| lookup_path(doc, field).map_or(KeyValue::Null, KeyValue::from))
                .collect(),
        )
    }
}

fn lookup_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Key pattern of a sharded collection, as stored on the config server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedCollection {
    /// Collection namespace.
    pub ns: Namespace,
    /// Shard-key fields in pattern order.
    pub key_fields: Vec<String>,
    /// True when the key is hashed.
    pub hashed: bool,
}

/// One chunk as listed on the config server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// Collection namespace.
    pub ns: Namespace,
    /// Owning shard.
    pub shard: String,
    /// Inclusive lower bound document.
    pub min: Document,
    /// Exclusive upper bound document.
    pub max: Document,
}

/// Half-open shard-key range `[min, max)` owned by one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Inclusive lower bound.
    pub min: ShardKey,
    /// Exclusive upper bound.
    pub max: ShardKey,
}

impl ChunkRange {
    /// True when `key` lies in `[min, max)`.
    pub fn contains(&self, key: &ShardKey) -> bool {
        &self.min <= key && key < &self.max
    }
}

/// Ranges one shard owns in one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionChunks {
    /// Shard-key fields in pattern order.
    pub key_fields: Vec<String>,
    /// True when the key is hashed.
    pub hashed: bool,
    /// Owned ranges sorted by lower bound.
    pub ranges: Vec<ChunkRange>,
}

/// Per-namespace chunk ranges of one shard.
pub type DbChunkMap = BTreeMap<Namespace, CollectionChunks>;

/// Shard name → owned ranges per namespace.
pub type ShardingChunkMap = BTreeMap<String, DbChunkMap>;

/// Group raw chunk metadata by owning shard and namespace.
pub fn build_chunk_map(
    collections: &[ShardedCollection],
    chunks: &[ChunkRecord],
) -> Result<ShardingChunkMap> {
    let patterns: BTreeMap<&Namespace, &ShardedCollection> =
        collections.iter().map(|c| (&c.ns, c)).collect();

    let mut map = ShardingChunkMap::new();
    for chunk in chunks {
        let Some(coll) = patterns.get(&chunk.ns) else {
            debug!(ns = %chunk.ns, "chunk of collection without key pattern skipped");
            continue;
        };
        for bound in [&chunk.min, &chunk.max] {
            if bound.len() != coll.key_fields.len() {
                return Err(SyncError::ChunkMap {
                    msg: format!(
                        "chunk bound of {} on shard {} has {} fields, key pattern has {}",
                        chunk.ns,
                        chunk.shard,
                        bound.len(),
                        coll.key_fields.len()
                    ),
                });
            }
        }
        let range = ChunkRange {
            min: ShardKey::from_document(&chunk.min, &coll.key_fields),
            max: ShardKey::from_document(&chunk.max, &coll.key_fields),
        };
        map.entry(chunk.shard.clone())
            .or_default()
            .entry(chunk.ns.clone())
            .or_insert_with(|| CollectionChunks {
                key_fields: coll.key_fields.clone(),
                hashed: coll.hashed,
                ranges: Vec::new(),
            })
            .ranges
            .push(range);
    }

    for db_map in map.values_mut() {
        for coll in db_map.values_mut() {
            coll.ranges.sort_by(|a, b| a.min.cmp(&b.min));
        }
    }
    Ok(map)
}

/// Describes the source so the fetcher can decide whether a chunk map is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMapRequest {
    /// Source is a sharded cluster.
    pub is_sharding: bool,
    /// Documents are read through a router rather than off shards.
    pub via_router: bool,
    /// Incremental fetch method.
    pub fetch_method: FetchMethod,
    /// Orphan filtering was requested.
    pub filter_orphan: bool,
}

/// Fetch the chunk map from the config server.
///
/// Returns an empty map when no filtering is needed. Fails when the balancer is
/// active, since copying against a moving chunk distribution tears reads.
pub async fn fetch_chunk_map(
    connector: &dyn Connector,
    config_server_url: Option<&str>,
    opts: &ConnectOptions,
    request: ChunkMapRequest,
) -> Result<ShardingChunkMap> {
    if !request.is_sharding
        || request.via_router
        || request.fetch_method == FetchMethod::ChangeStream
    {
        return Ok(ShardingChunkMap::new());
    }

    let url = config_server_url
        .map(|entry| Source::parse(entry, 0).url)
        .ok_or_else(|| SyncError::Config {
            msg: "mongo_cs_url is required for a sharded source".to_string(),
        })?;
    let masked = mask_url_password(&url, "***");
    let cs = connector.config_server(&url, opts).await?;

    let active = cs.balancer_active().await.map_err(|e| SyncError::ChunkMap {
        msg: format!("obtain balancer status from {} error: {}", masked, e),
    })?;
    if active {
        return Err(SyncError::BalancerActive { url: masked });
    }

    if !request.filter_orphan {
        return Ok(ShardingChunkMap::new());
    }

    info!(config_server = %masked, "fetching chunk map of source sharding");
    let collections = cs.sharded_collections().await?;
    let chunks = cs.chunks().await?;
    let map = build_chunk_map(&collections, &chunks)?;
    info!(
        shards = map.len(),
        chunks = chunks.len(),
        "chunk map fetched"
    );
    Ok(map)
}
