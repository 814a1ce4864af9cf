//! The remote chain client contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::filter::{LogAddress, LogFilter};
use crate::types::{Block, Log, Trace, TransactionReceipt};

/// Which block to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSelector {
    Number(u64),
    Latest,
}

/// An `eth_getLogs`-shaped query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogQuery {
    /// `None` = any emitter.
    pub address: Option<Vec<String>>,
    pub topics: Vec<Option<Vec<String>>>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    /// Query for `filter` over `[from_block, to_block]`.
    ///
    /// Factory filters query every emitter; children are matched afterwards
    /// against the known child addresses.
    pub fn for_filter(filter: &LogFilter, from_block: u64, to_block: u64) -> Self {
        let address = match &filter.address {
            LogAddress::Static(list) if !list.is_empty() => Some(list.clone()),
            LogAddress::Static(_) | LogAddress::Any | LogAddress::Factory(_) => None,
        };
        Self {
            address,
            topics: filter.topics.clone(),
            from_block,
            to_block,
        }
    }

    /// Creation logs of a factory over `[from_block, to_block]`.
    pub fn for_factory(
        factory: &crate::filter::Factory,
        from_block: u64,
        to_block: u64,
    ) -> Self {
        Self {
            address: Some(vec![factory.address.clone()]),
            topics: vec![Some(vec![factory.event_selector.clone()])],
            from_block,
            to_block,
        }
    }
}

/// Access to one chain's data.
///
/// Implementations do not retry; callers see every failure.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn chain_id(&self) -> Result<u64, SyncError>;

    /// Fetch a block with its transactions. `None` if the node doesn't have it.
    async fn get_block(&self, selector: BlockSelector) -> Result<Option<Block>, SyncError>;

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SyncError>;

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, SyncError>;

    /// Call traces of a block. Clients without trace support return nothing.
    async fn get_block_traces(&self, _block_number: u64) -> Result<Vec<Trace>, SyncError> {
        Ok(Vec::new())
    }

    /// Arbitrary JSON-RPC call.
    async fn request(&self, method: &str, params: Value) -> Result<Value, SyncError>;
}
