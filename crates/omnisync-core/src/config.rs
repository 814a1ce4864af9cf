//! Sync configuration: networks, sources and engine options.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::filter::Source;

/// One chain the engine follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Human-readable network name (e.g. `"mainnet"`). Keys the status map.
    pub name: String,
    pub chain_id: u64,
    /// Blocks behind the tip considered final.
    /// Typical values: 65 (Ethereum), 200 (Polygon), 2 (fast L2s).
    #[serde(default = "default_finality_block_count")]
    pub finality_block_count: u64,
    /// Tip polling interval in realtime mode (milliseconds).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Token-bucket refill rate of the request queue.
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    /// Requests in flight at once.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Drop this chain's stored data on start and never record intervals.
    #[serde(default)]
    pub disable_cache: bool,
}

fn default_finality_block_count() -> u64 {
    65
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_requests_per_second() -> u32 {
    50
}

fn default_max_concurrent_requests() -> usize {
    25
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
            finality_block_count: default_finality_block_count(),
            poll_interval_ms: default_poll_interval_ms(),
            max_requests_per_second: default_max_requests_per_second(),
            max_concurrent_requests: default_max_concurrent_requests(),
            disable_cache: false,
        }
    }

    pub fn finality_block_count(mut self, blocks: u64) -> Self {
        self.finality_block_count = blocks;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn disable_cache(mut self) -> Self {
        self.disable_cache = true;
        self
    }
}

/// Engine-wide tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Target number of events per historical batch.
    pub events_query_size: usize,
    /// A finalized block older than this is refetched before realtime starts.
    pub handoff_stale_seconds: u64,
    /// Consecutive store failures tolerated while paging events.
    pub events_retry_limit: u32,
    /// Factor the time window shrinks by after a failed page.
    pub events_shrink_factor: u64,
    /// Encoded checkpoint to resume event delivery from.
    pub initial_checkpoint: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            events_query_size: 10_000,
            handoff_stale_seconds: 300,
            events_retry_limit: 4,
            events_shrink_factor: 10,
            initial_checkpoint: None,
        }
    }
}

/// Everything needed to build a sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub networks: Vec<NetworkConfig>,
    pub sources: Vec<Source>,
    #[serde(default)]
    pub options: SyncOptions,
}

impl SyncConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn network(&self, chain_id: u64) -> Option<&NetworkConfig> {
        self.networks.iter().find(|n| n.chain_id == chain_id)
    }

    /// Sources that index `chain_id`.
    pub fn sources_for(&self, chain_id: u64) -> impl Iterator<Item = &Source> {
        self.sources.iter().filter(move |s| s.chain_id() == chain_id)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.networks.is_empty() {
            return Err(SyncError::Config("at least one network is required".into()));
        }

        let mut chain_ids = HashSet::new();
        let mut names = HashSet::new();
        for network in &self.networks {
            if !chain_ids.insert(network.chain_id) {
                return Err(SyncError::Config(format!(
                    "duplicate chain id {}",
                    network.chain_id
                )));
            }
            if !names.insert(network.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate network name {:?}",
                    network.name
                )));
            }
            if network.finality_block_count == 0 {
                tracing::warn!(
                    network = %network.name,
                    chain_id = network.chain_id,
                    "finality_block_count is 0, any reorg will be fatal"
                );
            }
            if network.max_concurrent_requests == 0 || network.max_requests_per_second == 0 {
                return Err(SyncError::Config(format!(
                    "network {:?} must allow at least one request",
                    network.name
                )));
            }
        }

        let mut source_names = HashSet::new();
        for source in &self.sources {
            if !source_names.insert(source.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate source name {:?}",
                    source.name
                )));
            }
            if !chain_ids.contains(&source.chain_id()) {
                return Err(SyncError::Config(format!(
                    "source {:?} uses unconfigured chain {}",
                    source.name,
                    source.chain_id()
                )));
            }
            if let (Some(from), Some(to)) = (source.filter.from_block, source.filter.to_block) {
                if from > to {
                    return Err(SyncError::Config(format!(
                        "source {:?} has from_block {from} after to_block {to}",
                        source.name
                    )));
                }
            }
        }

        for network in &self.networks {
            if self.sources_for(network.chain_id).next().is_none() {
                return Err(SyncError::Config(format!(
                    "network {:?} has no sources",
                    network.name
                )));
            }
        }

        if self.options.events_query_size == 0 {
            return Err(SyncError::Config("events_query_size must be positive".into()));
        }
        if self.options.events_shrink_factor < 2 {
            return Err(SyncError::Config("events_shrink_factor must be at least 2".into()));
        }
        if let Some(checkpoint) = &self.options.initial_checkpoint {
            crate::checkpoint::Checkpoint::decode(checkpoint)?;
        }

        Ok(())
    }
}
