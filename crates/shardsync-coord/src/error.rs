//! Error types for the full-sync coordinator.

use crate::coordinator::SyncPhase;
use thiserror::Error;

/// Errors that can occur while coordinating a full sync.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid or contradictory configuration.
    #[error("config error: {msg}")]
    Config {
        /// Error message describing the issue.
        msg: String,
    },

    /// Source topology cannot be handled as configured.
    #[error("topology error: {msg}")]
    Topology {
        /// Error message describing the issue.
        msg: String,
    },

    /// The sharded source has its balancer running.
    #[error("source sharding need to stop balancer when document replication occur (config server {url})")]
    BalancerActive {
        /// Config-server URL, password masked.
        url: String,
    },

    /// Could not open a connection.
    #[error("connect to {url} failed: {msg}")]
    Connect {
        /// Connection URL, password masked.
        url: String,
        /// Error message from the connector.
        msg: String,
    },

    /// A source query failed.
    #[error("source error: {msg}")]
    Source {
        /// Error message describing the issue.
        msg: String,
    },

    /// A target operation failed.
    #[error("target error: {msg}")]
    Target {
        /// Error message describing the issue.
        msg: String,
    },

    /// Chunk metadata could not be read or was malformed.
    #[error("chunk map error: {msg}")]
    ChunkMap {
        /// Error message describing the issue.
        msg: String,
    },

    /// Timestamp sampling or reconciliation failed.
    #[error("timestamp error: {msg}")]
    Timestamp {
        /// Error message describing the issue.
        msg: String,
    },

    /// A copy worker failed.
    #[error("document syncer-{worker} for {source_url} failed: {error}")]
    Copy {
        /// Worker index.
        worker: usize,
        /// Source URL, password masked.
        source_url: String,
        /// The terminal error of the worker.
        #[source]
        error: Box<SyncError>,
    },

    /// Checkpoint persistence failed.
    #[error("checkpoint error: {msg}")]
    Checkpoint {
        /// Error message describing the issue.
        msg: String,
    },

    /// A unique index other than the identity index was found.
    #[error("extra job[{job}] with source[{source_url}] query collection[{ns}] find unique index[{index}]")]
    UniqueIndexViolation {
        /// Job name.
        job: String,
        /// Source URL, password masked.
        source_url: String,
        /// Namespace holding the index.
        ns: String,
        /// Offending index name.
        index: String,
    },

    /// A coordinator phase failed.
    #[error("phase {phase} failed: {error}")]
    Phase {
        /// The phase in which the failure happened.
        phase: SyncPhase,
        /// The underlying failure.
        #[source]
        error: Box<SyncError>,
    },

    /// Serialization/deserialization error.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Wrap this error with the phase it happened in.
    pub fn in_phase(self, phase: SyncPhase) -> Self {
        match self {
            SyncError::Phase { .. } => self,
            other => SyncError::Phase {
                phase,
                error: Box::new(other),
            },
        }
    }

    /// The phase this error was raised in, if it was tagged with one.
    pub fn phase(&self) -> Option<SyncPhase> {
        match self {
            SyncError::Phase { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Strip any phase wrapper and return the innermost error.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Phase { error, .. } => error.root(),
            SyncError::Copy { error, .. } => error.root(),
            other => other,
        }
    }
}

/// Result alias for coordinator operations.
pub type Result<T> = std::result::Result<T, SyncError>;
