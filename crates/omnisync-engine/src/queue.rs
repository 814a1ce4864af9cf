//! Per-chain request queue: bounded concurrency plus a token-bucket rate limit.
//!
//! Every call a sync makes to a chain goes through one [`RequestQueue`]. A
//! semaphore caps the requests in flight; a token bucket refilling at
//! `max_requests_per_second` spaces them out. Nothing here retries.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};

use omnisync_core::client::{BlockSelector, ChainClient, LogQuery};
use omnisync_core::config::NetworkConfig;
use omnisync_core::error::SyncError;
use omnisync_core::types::{Block, Log, Trace, TransactionReceipt};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket: tokens accrue at `refill_rate` per second up to `capacity`.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available; otherwise how long until one is.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate))
        }
    }
}

/// A [`ChainClient`] that queues calls to the wrapped client.
pub struct RequestQueue {
    client: Arc<dyn ChainClient>,
    permits: Semaphore,
    bucket: TokenBucket,
}

impl RequestQueue {
    pub fn new(client: Arc<dyn ChainClient>, network: &NetworkConfig) -> Self {
        let rate = f64::from(network.max_requests_per_second.max(1));
        Self {
            client,
            permits: Semaphore::new(network.max_concurrent_requests.max(1)),
            bucket: TokenBucket::new(rate, rate),
        }
    }

    /// Wait for a concurrency slot and a rate-limit token.
    async fn acquire(&self) -> Result<SemaphorePermit<'_>, SyncError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| SyncError::Rpc(e.to_string()))?;
        while let Err(wait) = self.bucket.try_acquire() {
            tokio::time::sleep(wait).await;
        }
        Ok(permit)
    }

    /// Requests currently allowed to start.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl ChainClient for RequestQueue {
    async fn chain_id(&self) -> Result<u64, SyncError> {
        let _permit = self.acquire().await?;
        self.client.chain_id().await
    }

    async fn get_block(&self, selector: BlockSelector) -> Result<Option<Block>, SyncError> {
        let _permit = self.acquire().await?;
        self.client.get_block(selector).await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SyncError> {
        let _permit = self.acquire().await?;
        self.client.get_logs(query).await
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, SyncError> {
        let _permit = self.acquire().await?;
        self.client.get_transaction_receipt(hash).await
    }

    async fn get_block_traces(&self, block_number: u64) -> Result<Vec<Trace>, SyncError> {
        let _permit = self.acquire().await?;
        self.client.get_block_traces(block_number).await
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, SyncError> {
        let _permit = self.acquire().await?;
        self.client.request(method, params).await
    }
}
