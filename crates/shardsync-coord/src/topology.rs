//! Source topology detection.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{FetchMethod, SyncConfig};
use crate::error::{Result, SyncError};
use crate::types::Source;

/// Replica name used for a router given as a plain URL.
pub const DEFAULT_ROUTER_NAME: &str = "mongos";

/// Shape of the source as seen by the full sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// A single replica set.
    ReplicaSet,
    /// A sharded cluster copied straight off each shard.
    ShardedDirect,
    /// A sharded cluster copied through its router.
    ShardedViaRouter,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::ReplicaSet => write!(f, "replica_set"),
            SourceKind::ShardedDirect => write!(f, "sharded_direct"),
            SourceKind::ShardedViaRouter => write!(f, "sharded_via_router"),
        }
    }
}

/// Sources of a run and the roles they play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Direct sources: every shard, or the one replica set.
    pub mongo_d: Vec<Source>,
    /// Router, when configured.
    pub mongo_s: Option<Source>,
    /// True when the source is a sharded cluster.
    pub is_sharding: bool,
    /// Incremental fetch method.
    pub fetch_method: FetchMethod,
    real_source_full_sync: Vec<Source>,
    real_source_incr_sync: Vec<Source>,
}

impl Topology {
    /// Derive the topology from configuration.
    pub fn detect(config: &SyncConfig) -> Result<Self> {
        let mongo_d: Vec<Source> = config
            .mongo_urls
            .iter()
            .enumerate()
            .map(|(i, entry)| Source::parse(entry, i))
            .collect();
        let mongo_s = config.mongo_s_url.as_deref().map(|entry| {
            let src = Source::parse(entry, 0);
            if entry.trim() == src.url {
                Source::new(src.url, DEFAULT_ROUTER_NAME)
            } else {
                src
            }
        });

        for src in mongo_d.iter().chain(mongo_s.iter()) {
            if !src.url.contains("://") {
                return Err(SyncError::Topology {
                    msg: format!("malformed connection string for {}", src.replica_name),
                });
            }
        }

        let fetch_method = config.incr_fetch_method;
        let is_sharding = match fetch_method {
            FetchMethod::ChangeStream => mongo_s.is_some(),
            FetchMethod::Oplog => mongo_d.len() > 1,
        };

        if fetch_method == FetchMethod::ChangeStream && mongo_s.is_none() && mongo_d.len() > 1 {
            return Err(SyncError::Topology {
                msg: "change_stream on a sharded source requires mongo_s_url".to_string(),
            });
        }
        if fetch_method == FetchMethod::Oplog
            && config.sync_mode.has_incremental()
            && mongo_d.is_empty()
        {
            return Err(SyncError::Topology {
                msg: "oplog fetch method requires mongo_urls".to_string(),
            });
        }

        let real_source_full_sync = match &mongo_s {
            Some(router) => vec![router.clone()],
            None => mongo_d.clone(),
        };
        let real_source_incr_sync = match (&mongo_s, fetch_method) {
            (Some(router), FetchMethod::ChangeStream) => vec![router.clone()],
            _ => mongo_d.clone(),
        };

        Ok(Self {
            mongo_d,
            mongo_s,
            is_sharding,
            fetch_method,
            real_source_full_sync,
            real_source_incr_sync,
        })
    }

    /// Sources the full copy reads from; one worker each.
    pub fn real_source_full_sync(&self) -> &[Source] {
        &self.real_source_full_sync
    }

    /// Sources the incremental phase reads from.
    pub fn real_source_incr_sync(&self) -> &[Source] {
        &self.real_source_incr_sync
    }

    /// True when documents are copied through the router.
    pub fn via_router(&self) -> bool {
        self.mongo_s.is_some()
    }

    /// Shape of the source.
    pub fn kind(&self) -> SourceKind {
        match (self.is_sharding, self.via_router()) {
            (false, _) => SourceKind::ReplicaSet,
            (true, false) => SourceKind::ShardedDirect,
            (true, true) => SourceKind::ShardedViaRouter,
        }
    }

    /// True when per-shard resume points collapse into the router's one stream.
    pub fn merges_checkpoint(&self) -> bool {
        self.mongo_s.is_some() && self.fetch_method == FetchMethod::ChangeStream
    }
}
