//! Store-backed cache for block-scoped RPC calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use omnisync_core::client::{BlockSelector, ChainClient, LogQuery};
use omnisync_core::error::SyncError;
use omnisync_core::store::SyncStore;
use omnisync_core::types::{Block, Log, Trace, TransactionReceipt};

/// Answers `request` calls pinned to a block number from the store.
///
/// A call is pinned when its last parameter is a hex block number (as in
/// `eth_call`, `eth_getBalance`, …). Results for a reorged block are pruned
/// through [`SyncStore::prune_rpc_request_result`]. Other calls pass through.
pub struct CachedClient {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn SyncStore>,
}

impl CachedClient {
    pub fn new(chain_id: u64, client: Arc<dyn ChainClient>, store: Arc<dyn SyncStore>) -> Self {
        Self {
            chain_id,
            client,
            store,
        }
    }
}

/// Block number a request is pinned to, if any.
fn pinned_block(params: &Value) -> Option<u64> {
    let last = params.as_array()?.last()?.as_str()?;
    let hex = last.strip_prefix("0x")?;
    u64::from_str_radix(hex, 16).ok()
}

#[async_trait]
impl ChainClient for CachedClient {
    async fn chain_id(&self) -> Result<u64, SyncError> {
        self.client.chain_id().await
    }

    async fn get_block(&self, selector: BlockSelector) -> Result<Option<Block>, SyncError> {
        self.client.get_block(selector).await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SyncError> {
        self.client.get_logs(query).await
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, SyncError> {
        self.client.get_transaction_receipt(hash).await
    }

    async fn get_block_traces(&self, block_number: u64) -> Result<Vec<Trace>, SyncError> {
        self.client.get_block_traces(block_number).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, SyncError> {
        let Some(block_number) = pinned_block(&params) else {
            return self.client.request(method, params).await;
        };

        let key = format!("{method}:{params}");
        if let Some(cached) = self.store.get_rpc_request_result(self.chain_id, &key).await? {
            debug!(chain_id = self.chain_id, method, block_number, "rpc cache hit");
            return serde_json::from_str(&cached).map_err(|e| SyncError::Storage(e.to_string()));
        }

        let result = self.client.request(method, params).await?;
        self.store
            .insert_rpc_request_result(self.chain_id, block_number, &key, &result.to_string())
            .await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_chain::InMemoryChain;
    use omnisync_storage::InMemoryStore;
    use serde_json::json;

    #[test]
    fn pinned_block_parses_trailing_hex() {
        assert_eq!(pinned_block(&json!([{ "to": "0x1" }, "0x10"])), Some(16));
        assert_eq!(pinned_block(&json!([{ "to": "0x1" }, "latest"])), None);
        assert_eq!(pinned_block(&json!({})), None);
    }

    #[tokio::test]
    async fn pinned_requests_hit_the_store() {
        let chain = Arc::new(InMemoryChain::new(1));
        let store = Arc::new(InMemoryStore::new());
        let client = CachedClient::new(1, chain.clone(), store.clone());

        let params = json!([{ "to": "0xabc" }, "0x5"]);
        let first = client.request("eth_call", params.clone()).await.unwrap();
        let second = client.request("eth_call", params.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(chain.request_calls(), 1);

        store.prune_rpc_request_result(1, &[5]).await.unwrap();
        client.request("eth_call", params).await.unwrap();
        assert_eq!(chain.request_calls(), 2);
    }

    #[tokio::test]
    async fn unpinned_requests_pass_through() {
        let chain = Arc::new(InMemoryChain::new(1));
        let store = Arc::new(InMemoryStore::new());
        let client = CachedClient::new(1, chain.clone(), store);

        client.request("eth_blockNumber", json!([])).await.unwrap();
        client.request("eth_blockNumber", json!([])).await.unwrap();
        assert_eq!(chain.request_calls(), 2);
    }
}
