//! The durable store contract the engine syncs into.
//!
//! Implementations live in `omnisync-storage` (`InMemoryStore`,
//! `SqliteStore`). The layout behind the trait is not a contract; only the
//! behavior below is.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::filter::{Factory, Fragment, Source};
use crate::interval::Interval;
use crate::types::{Block, Log, RawEvent, Trace, Transaction, TransactionReceipt};

/// A log as stored. Only logs with a checkpoint are events; factory creation
/// logs are stored without one so child addresses survive a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub log: Log,
    pub checkpoint: Option<String>,
}

impl LogRecord {
    pub fn event(log: Log, checkpoint: String) -> Self {
        Self {
            log,
            checkpoint: Some(checkpoint),
        }
    }

    pub fn factory(log: Log) -> Self {
        Self {
            log,
            checkpoint: None,
        }
    }
}

/// Everything one historical window or one finalize writes for a chain.
///
/// Applied atomically by [`SyncStore::insert_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncBatch {
    pub chain_id: u64,
    /// Blocks are stored without their transaction lists.
    pub blocks: Vec<Block>,
    pub logs: Vec<LogRecord>,
    pub transactions: Vec<Transaction>,
    pub transaction_receipts: Vec<TransactionReceipt>,
    pub traces: Vec<Trace>,
    pub intervals: Vec<(Fragment, Interval)>,
}

impl SyncBatch {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.logs.is_empty()
            && self.transactions.is_empty()
            && self.transaction_receipts.is_empty()
            && self.traces.is_empty()
            && self.intervals.is_empty()
    }
}

/// One page request over the ordered event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub sources: Vec<Source>,
    /// Exclusive lower bound (encoded checkpoint).
    pub from: String,
    /// Inclusive upper bound (encoded checkpoint).
    pub to: String,
    /// Soft page size. A page never splits the events of one log, so it may
    /// run over by the number of sources matching the last log.
    pub limit: usize,
}

/// One page of events plus where the next page starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPage {
    /// Ordered by checkpoint, then source order.
    pub events: Vec<RawEvent>,
    /// Checkpoint of the last returned event when the limit was hit,
    /// otherwise the query's `to`.
    pub cursor: String,
}

/// Durable storage for synced chain data, intervals and cached RPC results.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn insert_blocks(&self, chain_id: u64, blocks: &[Block]) -> Result<(), SyncError>;

    /// Upsert logs. A stored checkpoint is never replaced by `None`.
    async fn insert_logs(&self, chain_id: u64, logs: &[LogRecord]) -> Result<(), SyncError>;

    async fn insert_transactions(
        &self,
        chain_id: u64,
        transactions: &[Transaction],
    ) -> Result<(), SyncError>;

    async fn insert_transaction_receipts(
        &self,
        chain_id: u64,
        receipts: &[TransactionReceipt],
    ) -> Result<(), SyncError>;

    async fn insert_traces(&self, chain_id: u64, traces: &[Trace]) -> Result<(), SyncError>;

    /// Merge intervals into each fragment's stored set.
    async fn insert_intervals(
        &self,
        chain_id: u64,
        intervals: &[(Fragment, Interval)],
    ) -> Result<(), SyncError>;

    /// Apply a whole batch. Backends override this to make it atomic.
    async fn insert_batch(&self, batch: SyncBatch) -> Result<(), SyncError> {
        let chain_id = batch.chain_id;
        self.insert_blocks(chain_id, &batch.blocks).await?;
        self.insert_logs(chain_id, &batch.logs).await?;
        self.insert_transactions(chain_id, &batch.transactions).await?;
        self.insert_transaction_receipts(chain_id, &batch.transaction_receipts)
            .await?;
        self.insert_traces(chain_id, &batch.traces).await?;
        self.insert_intervals(chain_id, &batch.intervals).await
    }

    /// Stored intervals for each fragment, in the order given. Every returned
    /// set is minimal.
    async fn get_intervals(
        &self,
        chain_id: u64,
        fragments: &[Fragment],
    ) -> Result<Vec<Vec<Interval>>, SyncError>;

    /// Events in `(query.from, query.to]` matching any of `query.sources`.
    async fn get_events(&self, query: &EventQuery) -> Result<EventPage, SyncError>;

    /// Child addresses announced by `factory` up to and including `to_block`.
    async fn get_child_addresses(
        &self,
        chain_id: u64,
        factory: &Factory,
        to_block: u64,
    ) -> Result<Vec<String>, SyncError>;

    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
        result: &str,
    ) -> Result<(), SyncError>;

    async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        request: &str,
    ) -> Result<Option<String>, SyncError>;

    /// Forget cached results for the given blocks.
    async fn prune_rpc_request_result(
        &self,
        chain_id: u64,
        block_numbers: &[u64],
    ) -> Result<(), SyncError>;

    /// Drop everything stored for `chain_id` at or above `from_block`,
    /// intervals included.
    async fn prune_by_chain(&self, chain_id: u64, from_block: u64) -> Result<(), SyncError>;
}
