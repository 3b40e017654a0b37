//! Run configuration.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which phases a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Full copy followed by incremental replication.
    All,
    /// Full copy only.
    Full,
    /// Incremental replication only.
    Incr,
}

impl SyncMode {
    /// True when an incremental phase follows (or replaces) the full copy.
    pub fn has_incremental(self) -> bool {
        !matches!(self, SyncMode::Full)
    }
}

/// How incremental sync consumes the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    /// Tail each shard's oplog directly.
    Oplog,
    /// Consume one ordered change stream.
    ChangeStream,
}

/// When indexes are created on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexCreation {
    /// Do not create indexes.
    None,
    /// Create in background mode before documents are copied.
    Background,
    /// Create after every worker finished.
    Foreground,
}

/// Namespace include/exclude rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Only these namespaces (or whole databases) are copied.
    pub namespace_white: Vec<String>,
    /// These namespaces (or whole databases) are skipped.
    pub namespace_black: Vec<String>,
    /// System databases that should be copied anyway.
    pub pass_special_db: Vec<String>,
}

/// Full-sync tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FullSyncConfig {
    /// Documents per read batch.
    pub reader_document_batch_size: usize,
    /// Drop target collections that already exist.
    pub collection_exist_drop: bool,
    /// Index creation mode.
    pub create_index: IndexCreation,
    /// Skip documents a shard holds but does not own.
    pub filter_orphan_document: bool,
    /// Global documents-per-second ceiling (0 = unlimited).
    pub qps_limit: u64,
    /// Port of the progress endpoint; disabled when unset.
    pub http_listen_port: Option<u16>,
}

impl Default for FullSyncConfig {
    fn default() -> Self {
        Self {
            reader_document_batch_size: 128,
            collection_exist_drop: false,
            create_index: IndexCreation::Foreground,
            filter_orphan_document: false,
            qps_limit: 0,
            http_listen_port: None,
        }
    }
}

/// Configuration for one replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Which phases run.
    pub sync_mode: SyncMode,
    /// Direct source URLs, one per shard or a single replica set.
    pub mongo_urls: Vec<String>,
    /// Router URL.
    pub mongo_s_url: Option<String>,
    /// Config-server URL.
    pub mongo_cs_url: Option<String>,
    /// Target URLs; the first one is used.
    pub tunnel_address: Vec<String>,
    /// Incremental fetch method.
    pub incr_fetch_method: FetchMethod,
    /// Namespace rules.
    pub filter: FilterConfig,
    /// Full-sync tuning.
    pub full_sync: FullSyncConfig,
    /// Namespaces whose incremental writes are sharded by object id.
    pub shard_by_object_id_whitelist: Vec<String>,
    /// Poll interval of verification jobs, in seconds.
    pub extra_job_interval_secs: u64,
    /// CA bundle for source connections.
    pub source_tls_root_ca: Option<PathBuf>,
    /// CA bundle for target connections.
    pub target_tls_root_ca: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::All,
            mongo_urls: Vec::new(),
            mongo_s_url: None,
            mongo_cs_url: None,
            tunnel_address: Vec::new(),
            incr_fetch_method: FetchMethod::Oplog,
            filter: FilterConfig::default(),
            full_sync: FullSyncConfig::default(),
            shard_by_object_id_whitelist: Vec::new(),
            extra_job_interval_secs: 10,
            source_tls_root_ca: None,
            target_tls_root_ca: None,
        }
    }
}

impl SyncConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SyncConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if !self.filter.namespace_white.is_empty() && !self.filter.namespace_black.is_empty() {
            return Err(config_err(
                "namespace white list and black list cannot both be set",
            ));
        }
        if self.mongo_urls.is_empty() && self.mongo_s_url.is_none() {
            return Err(config_err("no source configured"));
        }
        if self.tunnel_address.is_empty() {
            return Err(config_err("no target configured"));
        }
        if self.full_sync.reader_document_batch_size == 0 {
            return Err(config_err("reader_document_batch_size must be positive"));
        }
        if self.extra_job_interval_secs == 0 {
            return Err(config_err("extra_job_interval_secs must be positive"));
        }
        let direct_sharded = self.mongo_urls.len() > 1 && self.mongo_s_url.is_none();
        if direct_sharded && self.mongo_cs_url.is_none() {
            return Err(config_err(
                "mongo_cs_url is required when copying directly from several shards",
            ));
        }
        Ok(())
    }

    /// The target URL the run writes to.
    pub fn target_url(&self) -> Result<&str> {
        self.tunnel_address
            .first()
            .map(String::as_str)
            .ok_or_else(|| config_err("no target configured"))
    }
}

fn config_err(msg: &str) -> SyncError {
    SyncError::Config {
        msg: msg.to_string(),
    }
}
