//! A scriptable in-memory chain for tests and demos.
//!
//! Blocks are mined on demand with the logs you hand in; [`InMemoryChain::reorg`]
//! replaces everything above an ancestor with a fresh fork. Call counters make
//! cache behavior observable.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use omnisync_core::client::{BlockSelector, ChainClient, LogQuery};
use omnisync_core::error::SyncError;
use omnisync_core::types::{Block, LightBlock, Log, Trace, Transaction, TransactionReceipt};

/// A log to include in the next mined block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
}

impl EmittedLog {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            topics: Vec::new(),
            data: "0x".into(),
        }
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    pub fn data(mut self, data: impl Into<String>) -> Self {
        self.data = data.into();
        self
    }
}

struct ChainData {
    blocks: Vec<Block>,
    logs: Vec<Log>,
    traces: Vec<Trace>,
    fork: u64,
    /// Block number to remaining `get_logs` failures for ranges covering it.
    log_failures: BTreeMap<u64, usize>,
}

/// In-memory [`ChainClient`].
pub struct InMemoryChain {
    chain_id: u64,
    reported_chain_id: AtomicU64,
    genesis_timestamp: u64,
    block_time: u64,
    data: Mutex<ChainData>,
    log_calls: AtomicUsize,
    block_calls: AtomicUsize,
    request_calls: AtomicUsize,
}

impl InMemoryChain {
    /// A chain holding only its genesis block, 12-second blocks.
    pub fn new(chain_id: u64) -> Self {
        Self::with_timing(chain_id, 1_700_000_000, 12)
    }

    pub fn with_timing(chain_id: u64, genesis_timestamp: u64, block_time: u64) -> Self {
        let chain = Self {
            chain_id,
            reported_chain_id: AtomicU64::new(chain_id),
            genesis_timestamp,
            block_time,
            data: Mutex::new(ChainData {
                blocks: Vec::new(),
                logs: Vec::new(),
                traces: Vec::new(),
                fork: 0,
                log_failures: BTreeMap::new(),
            }),
            log_calls: AtomicUsize::new(0),
            block_calls: AtomicUsize::new(0),
            request_calls: AtomicUsize::new(0),
        };
        chain.mine(Vec::new());
        chain
    }

    /// Make `chain_id()` answer something other than the configured id.
    pub fn report_chain_id(&self, chain_id: u64) {
        self.reported_chain_id.store(chain_id, Ordering::SeqCst);
    }

    /// Fail the next `count` `get_logs` calls whose range covers `block`,
    /// with a retryable error.
    pub fn fail_logs_at(&self, block: u64, count: usize) {
        self.data().log_failures.insert(block, count);
    }

    fn data(&self) -> MutexGuard<'_, ChainData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hash(&self, fork: u64, number: u64, index: Option<u64>) -> String {
        match index {
            None => format!("0x{:016x}{:016x}{:032x}", self.chain_id, fork, number),
            Some(i) => format!("0x{:016x}{:016x}{:016x}{:016x}", self.chain_id, fork, number, i + 1),
        }
    }

    /// Mine one block containing `logs`, one transaction per log.
    pub fn mine(&self, logs: Vec<EmittedLog>) -> LightBlock {
        let mut data = self.data();
        let number = data.blocks.len() as u64;
        let fork = data.fork;
        let hash = self.hash(fork, number, None);
        let parent_hash = data
            .blocks
            .last()
            .map_or_else(|| "0x".to_string(), |b| b.hash.clone());

        let mut transactions = Vec::with_capacity(logs.len());
        for (i, emitted) in logs.into_iter().enumerate() {
            let tx_hash = self.hash(fork, number, Some(i as u64));
            transactions.push(Transaction {
                hash: tx_hash.clone(),
                block_number: number,
                block_hash: hash.clone(),
                transaction_index: i as u32,
                from: "0x00000000000000000000000000000000000000f1".into(),
                to: Some(emitted.address.clone()),
                input: "0x".into(),
                value: "0".into(),
            });
            data.traces.push(Trace {
                transaction_hash: tx_hash.clone(),
                block_number: number,
                block_hash: hash.clone(),
                transaction_index: i as u32,
                trace_index: 0,
                call_type: "CALL".into(),
                from: "0x00000000000000000000000000000000000000f1".into(),
                to: Some(emitted.address.clone()),
                input: "0x".into(),
                output: Some("0x".into()),
            });
            data.logs.push(Log {
                address: emitted.address,
                topics: emitted.topics,
                data: emitted.data,
                block_number: number,
                block_hash: hash.clone(),
                transaction_hash: tx_hash,
                transaction_index: Some(i as u32),
                log_index: Some(i as u32),
            });
        }

        let block = Block {
            number,
            hash,
            parent_hash,
            timestamp: self.genesis_timestamp + number * self.block_time,
            miner: "0x0000000000000000000000000000000000000000".into(),
            gas_used: 21_000 * transactions.len() as u64,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(1),
            transactions,
        };
        let light = block.light();
        data.blocks.push(block);
        light
    }

    /// Mine `count` empty blocks, returning the last one.
    pub fn mine_empty(&self, count: u64) -> LightBlock {
        let mut last = self.head();
        for _ in 0..count {
            last = self.mine(Vec::new());
        }
        last
    }

    /// Drop every block above `ancestor`. Blocks mined afterwards get new hashes.
    pub fn reorg(&self, ancestor: u64) {
        let mut data = self.data();
        let keep = (ancestor + 1) as usize;
        data.blocks.truncate(keep);
        data.logs.retain(|l| l.block_number <= ancestor);
        data.traces.retain(|t| t.block_number <= ancestor);
        data.fork += 1;
    }

    pub fn head(&self) -> LightBlock {
        let data = self.data();
        data.blocks
            .last()
            .map(Block::light)
            .unwrap_or_else(|| LightBlock {
                number: 0,
                hash: "0x".into(),
                parent_hash: "0x".into(),
                timestamp: self.genesis_timestamp,
            })
    }

    pub fn block(&self, number: u64) -> Option<LightBlock> {
        self.data().blocks.get(number as usize).map(Block::light)
    }

    /// `eth_getLogs` calls served so far.
    pub fn log_calls(&self) -> usize {
        self.log_calls.load(Ordering::SeqCst)
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }
}

fn topics_match(wanted: &[Option<Vec<String>>], topics: &[String]) -> bool {
    wanted.iter().enumerate().all(|(i, allowed)| match allowed {
        None => true,
        Some(values) => topics
            .get(i)
            .is_some_and(|t| values.iter().any(|v| v.eq_ignore_ascii_case(t))),
    })
}

#[async_trait]
impl ChainClient for InMemoryChain {
    async fn chain_id(&self) -> Result<u64, SyncError> {
        Ok(self.reported_chain_id.load(Ordering::SeqCst))
    }

    async fn get_block(&self, selector: BlockSelector) -> Result<Option<Block>, SyncError> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        let data = self.data();
        Ok(match selector {
            BlockSelector::Number(n) => data.blocks.get(n as usize).cloned(),
            BlockSelector::Latest => data.blocks.last().cloned(),
        })
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SyncError> {
        self.log_calls.fetch_add(1, Ordering::SeqCst);
        if query.from_block > query.to_block {
            return Err(SyncError::Rpc(format!(
                "invalid range {}..{}",
                query.from_block, query.to_block
            )));
        }
        let mut data = self.data();
        if let Some((_, remaining)) = data
            .log_failures
            .range_mut(query.from_block..=query.to_block)
            .find(|(_, remaining)| **remaining > 0)
        {
            *remaining -= 1;
            return Err(SyncError::Rpc("transient".into()));
        }
        Ok(data
            .logs
            .iter()
            .filter(|l| query.from_block <= l.block_number && l.block_number <= query.to_block)
            .filter(|l| {
                query
                    .address
                    .as_ref()
                    .map_or(true, |list| list.iter().any(|a| a.eq_ignore_ascii_case(&l.address)))
            })
            .filter(|l| topics_match(&query.topics, &l.topics))
            .cloned()
            .collect())
    }

    async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, SyncError> {
        let data = self.data();
        Ok(data
            .blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .find(|t| t.hash == hash)
            .map(|t| TransactionReceipt {
                transaction_hash: t.hash.clone(),
                block_number: t.block_number,
                block_hash: t.block_hash.clone(),
                transaction_index: t.transaction_index,
                status: true,
                gas_used: 21_000,
                contract_address: None,
            }))
    }

    async fn get_block_traces(&self, block_number: u64) -> Result<Vec<Trace>, SyncError> {
        Ok(self
            .data()
            .traces
            .iter()
            .filter(|t| t.block_number == block_number)
            .cloned()
            .collect())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, SyncError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "method": method, "params": params, "chain_id": self.chain_id }))
    }
}
