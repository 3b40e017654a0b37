//! Per-shard orphan-document filter.

use std::collections::BTreeSet;
use std::sync::Mutex;
use tracing::warn;

use crate::chunk_map::{CollectionChunks, DbChunkMap, ShardKey};
use crate::types::{Document, Namespace};

/// Decides whether a document read off one shard is owned by that shard.
///
/// Built from the shard's own slice of the chunk map only. Namespaces without
/// chunk entries, and hashed-key collections, keep every document.
#[derive(Debug)]
pub struct OrphanFilter {
    replica_name: String,
    chunks: DbChunkMap,
    warned_hashed: Mutex<BTreeSet<Namespace>>,
}

impl OrphanFilter {
    /// Create a filter for `replica_name` from its chunk slice.
    pub fn new(replica_name: impl Into<String>, chunks: DbChunkMap) -> Self {
        Self {
            replica_name: replica_name.into(),
            chunks,
            warned_hashed: Mutex::new(BTreeSet::new()),
        }
    }

    /// The shard this filter belongs to.
    pub fn replica_name(&self) -> &str {
        &self.replica_name
    }

    /// True when `doc` of `ns` falls inside one of this shard's ranges.
    pub fn owns(&self, ns: &Namespace, doc: &Document) -> bool {
        let Some(coll) = self.chunks.get(ns) else {
            return true;
        };
        if coll.hashed {
            self.warn_hashed_once(ns);
            return true;
        }
        let key = ShardKey::from_document(doc, &coll.key_fields);
        owns_key(coll, &key)
    }

    /// Keep owned documents of a batch; returns how many were dropped.
    pub fn retain_owned(&self, ns: &Namespace, docs: &mut Vec<Document>) -> usize {
        if !self.chunks.contains_key(ns) {
            return 0;
        }
        let before = docs.len();
        docs.retain(|doc| self.owns(ns, doc));
        before - docs.len()
    }

    fn warn_hashed_once(&self, ns: &Namespace) {
        let mut warned = match self.warned_hashed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if warned.insert(ns.clone()) {
            warn!(
                shard = %self.replica_name,
                ns = %ns,
                "hashed shard key, orphan documents of this collection are not filtered"
            );
        }
    }
}

fn owns_key(coll: &CollectionChunks, key: &ShardKey) -> bool {
    // Ranges are sorted by lower bound and disjoint: the only candidate is the
    // last range starting at or before the key.
    let idx = coll.ranges.partition_point(|r| &r.min <= key);
    idx > 0 && coll.ranges[idx - 1].contains(key)
}
