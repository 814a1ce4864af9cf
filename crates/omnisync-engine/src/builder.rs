//! Fluent builder for a [`Sync`].
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn run(client: std::sync::Arc<dyn omnisync_core::client::ChainClient>) -> Result<(), omnisync_core::error::SyncError> {
//! use omnisync_core::config::NetworkConfig;
//! use omnisync_core::filter::{LogFilter, Source};
//! use omnisync_engine::SyncBuilder;
//!
//! let sync = SyncBuilder::new()
//!     .network(NetworkConfig::new("mainnet", 1).finality_block_count(65), client)
//!     .source(Source::new(
//!         "usdc",
//!         LogFilter::address(1, "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48").from_block(6_082_465),
//!     ))
//!     .events_query_size(5_000)
//!     .build()
//!     .await?;
//! # Ok(()) }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use omnisync_core::client::ChainClient;
use omnisync_core::config::{NetworkConfig, SyncConfig, SyncOptions};
use omnisync_core::error::SyncError;
use omnisync_core::filter::Source;
use omnisync_core::store::SyncStore;
use omnisync_storage::InMemoryStore;

use crate::consumer::{LogConsumer, SyncConsumer};
use crate::sync::Sync;

/// Fluent builder for [`Sync`]. Defaults to an [`InMemoryStore`] and a
/// [`LogConsumer`].
#[derive(Default)]
pub struct SyncBuilder {
    config: SyncConfig,
    clients: BTreeMap<u64, Arc<dyn ChainClient>>,
    store: Option<Arc<dyn SyncStore>>,
    consumer: Option<Arc<dyn SyncConsumer>>,
}

impl SyncBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a parsed configuration. Clients still have to be attached
    /// with [`SyncBuilder::client`].
    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a network and the client that talks to it.
    pub fn network(mut self, network: NetworkConfig, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(network.chain_id, client);
        self.config.networks.retain(|n| n.chain_id != network.chain_id);
        self.config.networks.push(network);
        self
    }

    /// Attach a client to an already configured network.
    pub fn client(mut self, chain_id: u64, client: Arc<dyn ChainClient>) -> Self {
        self.clients.insert(chain_id, client);
        self
    }

    pub fn source(mut self, source: Source) -> Self {
        self.config.sources.push(source);
        self
    }

    pub fn options(mut self, options: SyncOptions) -> Self {
        self.config.options = options;
        self
    }

    /// Soft page size of the historical event stream.
    pub fn events_query_size(mut self, size: usize) -> Self {
        self.config.options.events_query_size = size;
        self
    }

    /// Resume delivery after this encoded checkpoint.
    pub fn initial_checkpoint(mut self, checkpoint: impl Into<String>) -> Self {
        self.config.options.initial_checkpoint = Some(checkpoint.into());
        self
    }

    pub fn store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn consumer(mut self, consumer: Arc<dyn SyncConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// The configuration collected so far.
    pub fn build_config(&self) -> &SyncConfig {
        &self.config
    }

    /// Probe every network and prepare the sync.
    pub async fn build(self) -> Result<Sync, SyncError> {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::new()));
        let consumer = self.consumer.unwrap_or_else(|| Arc::new(LogConsumer));
        Sync::new(self.config, self.clients, store, consumer).await
    }
}
