//! Error types for the omnisync pipeline.

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Errors that can occur while syncing.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Upstream data is missing something the engine cannot do without
    /// (e.g. a log without a log index). Never retried.
    #[error("Malformed data from chain {chain_id}: {reason}")]
    MalformedData { chain_id: u64, reason: String },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(
        "Reorg on chain {chain_id} reached block {ancestor}, below finalized block {finalized}"
    )]
    ReorgTooDeep {
        chain_id: u64,
        ancestor: u64,
        finalized: u64,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Sync was killed")]
    Killed,

    #[error("{0}")]
    Other(String),
}

impl SyncError {
    pub fn malformed(chain_id: u64, reason: impl Into<String>) -> Self {
        Self::MalformedData {
            chain_id,
            reason: reason.into(),
        }
    }

    /// Returns `true` if the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Storage(_))
    }
}
