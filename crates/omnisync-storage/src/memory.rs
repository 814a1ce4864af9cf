//! In-memory sync store.
//!
//! Keeps every table in RAM behind one mutex, so each call (and each
//! [`SyncBatch`]) is applied atomically. Useful for tests and short-lived syncs.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use omnisync_core::error::SyncError;
use omnisync_core::filter::{Factory, Fragment};
use omnisync_core::interval::{self, Interval};
use omnisync_core::store::{EventPage, EventQuery, LogRecord, SyncBatch, SyncStore};
use omnisync_core::types::{Block, Trace, Transaction, TransactionReceipt};

use crate::events::{self, ChildIndex};

#[derive(Default)]
struct ChainTables {
    blocks: BTreeMap<u64, Block>,
    logs: HashMap<String, LogRecord>,
    transactions: HashMap<String, Transaction>,
    receipts: HashMap<String, TransactionReceipt>,
    traces: BTreeMap<(u64, String, u32), Trace>,
    intervals: HashMap<String, Vec<Interval>>,
    /// request → (block number, result)
    rpc_results: HashMap<String, (u64, String)>,
}

#[derive(Default)]
struct Tables {
    chains: HashMap<u64, ChainTables>,
    /// checkpoint → (chain id, log id); the global event order.
    events: BTreeMap<String, (u64, String)>,
}

impl Tables {
    fn chain(&mut self, chain_id: u64) -> &mut ChainTables {
        self.chains.entry(chain_id).or_default()
    }

    fn insert_blocks(&mut self, chain_id: u64, blocks: &[Block]) {
        let chain = self.chain(chain_id);
        for block in blocks {
            chain.blocks.insert(block.number, block.without_transactions());
        }
    }

    fn insert_logs(&mut self, chain_id: u64, logs: &[LogRecord]) {
        for record in logs {
            let id = record.log.id();
            let chain = self.chain(chain_id);
            let checkpoint = match chain.logs.get(&id) {
                Some(existing) if record.checkpoint.is_none() => existing.checkpoint.clone(),
                _ => record.checkpoint.clone(),
            };
            chain.logs.insert(
                id.clone(),
                LogRecord {
                    log: record.log.clone(),
                    checkpoint: checkpoint.clone(),
                },
            );
            if let Some(checkpoint) = checkpoint {
                self.events.insert(checkpoint, (chain_id, id));
            }
        }
    }

    fn insert_transactions(&mut self, chain_id: u64, transactions: &[Transaction]) {
        let chain = self.chain(chain_id);
        for tx in transactions {
            chain.transactions.insert(tx.hash.clone(), tx.clone());
        }
    }

    fn insert_receipts(&mut self, chain_id: u64, receipts: &[TransactionReceipt]) {
        let chain = self.chain(chain_id);
        for receipt in receipts {
            chain
                .receipts
                .insert(receipt.transaction_hash.clone(), receipt.clone());
        }
    }

    fn insert_traces(&mut self, chain_id: u64, traces: &[Trace]) {
        let chain = self.chain(chain_id);
        for trace in traces {
            chain.traces.insert(
                (trace.block_number, trace.transaction_hash.clone(), trace.trace_index),
                trace.clone(),
            );
        }
    }

    fn insert_intervals(&mut self, chain_id: u64, intervals: &[(Fragment, Interval)]) {
        let chain = self.chain(chain_id);
        for (fragment, range) in intervals {
            let stored = chain.intervals.entry(fragment.id.clone()).or_default();
            stored.push(*range);
            *stored = interval::union(stored);
        }
    }

    fn child_index(&self, query_factories: &[&Factory], chain_id: u64) -> ChildIndex {
        let mut index = ChildIndex::default();
        if let Some(chain) = self.chains.get(&chain_id) {
            for record in chain.logs.values() {
                for factory in query_factories {
                    index.observe(factory, &record.log);
                }
            }
        }
        index
    }
}

/// Sync store held entirely in memory. All data is lost when it is dropped.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored logs that are events (carry a checkpoint).
    pub fn event_count(&self) -> usize {
        self.tables().events.len()
    }

    /// Number of stored blocks for a chain.
    pub fn block_count(&self, chain_id: u64) -> usize {
        self.tables()
            .chains
            .get(&chain_id)
            .map_or(0, |chain| chain.blocks.len())
    }

    pub fn has_block(&self, chain_id: u64, number: u64) -> bool {
        self.tables()
            .chains
            .get(&chain_id)
            .is_some_and(|chain| chain.blocks.contains_key(&number))
    }

    pub fn receipt_count(&self, chain_id: u64) -> usize {
        self.tables()
            .chains
            .get(&chain_id)
            .map_or(0, |chain| chain.receipts.len())
    }
}

#[async_trait]
impl SyncStore for InMemoryStore {
    async fn insert_blocks(&self, chain_id: u64, blocks: &[Block]) -> Result<(), SyncError> {
        self.tables().insert_blocks(chain_id, blocks);
        Ok(())
    }

    async fn insert_logs(&self, chain_id: u64, logs: &[LogRecord]) -> Result<(), SyncError> {
        self.tables().insert_logs(chain_id, logs);
        Ok(())
    }

    async fn insert_transactions(
        &self,
        chain_id: u64,
        transactions: &[Transaction],
    ) -> Result<(), SyncError> {
        self.tables().insert_transactions(chain_id, transactions);
        Ok(())
    }

    async fn insert_transaction_receipts(
        &self,
        chain_id: u64,
        receipts: &[TransactionReceipt],
    ) -> Result<(), SyncError> {
        self.tables().insert_receipts(chain_id, receipts);
        Ok(())
    }

    async fn insert_traces(&self, chain_id: u64, traces: &[Trace]) -> Result<(), SyncError> {
        self.tables().insert_traces(chain_id, traces);
        Ok(())
    }

    async fn insert_intervals(
        &self,
        chain_id: u64,
        intervals: &[(Fragment, Interval)],
    ) -> Result<(), SyncError> {
        self.tables().insert_intervals(chain_id, intervals);
        Ok(())
    }

    async fn insert_batch(&self, batch: SyncBatch) -> Result<(), SyncError> {
        let mut tables = self.tables();
        let chain_id = batch.chain_id;
        tables.insert_blocks(chain_id, &batch.blocks);
        tables.insert_logs(chain_id, &batch.logs);
        tables.insert_transactions(chain_id, &batch.transactions);
        tables.insert_receipts(chain_id, &batch.transaction_receipts);
        tables.insert_traces(chain_id, &batch.traces);
        tables.insert_intervals(chain_id, &batch.intervals);
        debug!(
            chain_id,
            blocks = batch.blocks.len(),
            logs = batch.logs.len(),
            intervals = batch.intervals.len(),
            "batch stored"
        );
        Ok(())
    }

    async fn get_intervals(
        &self,
        chain_id: u64,
        fragments: &[Fragment],
    ) -> Result<Vec<Vec<Interval>>, SyncError> {
        let tables = self.tables();
        let chain = tables.chains.get(&chain_id);
        Ok(fragments
            .iter()
            .map(|fragment| {
                chain
                    .and_then(|c| c.intervals.get(&fragment.id))
                    .cloned()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn get_events(&self, query: &EventQuery) -> Result<EventPage, SyncError> {
        let tables = self.tables();

        if query.from >= query.to {
            return Ok(EventPage {
                events: Vec::new(),
                cursor: query.to.clone(),
            });
        }

        let mut indexes: HashMap<u64, ChildIndex> = HashMap::new();
        let mut result = Vec::new();
        let range = (
            Bound::Excluded(query.from.clone()),
            Bound::Included(query.to.clone()),
        );

        for (checkpoint, (chain_id, log_id)) in tables.events.range(range) {
            let Some(chain) = tables.chains.get(chain_id) else {
                continue;
            };
            let Some(record) = chain.logs.get(log_id) else {
                continue;
            };
            let children = indexes.entry(*chain_id).or_insert_with(|| {
                let factories = events::factories_for(&query.sources, *chain_id);
                tables.child_index(&factories, *chain_id)
            });
            let sources = events::matching_sources(&query.sources, *chain_id, &record.log, children);
            let built = events::build_events(
                &sources,
                *chain_id,
                checkpoint,
                &record.log,
                chain.blocks.get(&record.log.block_number),
                chain.transactions.get(&record.log.transaction_hash),
            )?;
            result.extend(built);

            if result.len() >= query.limit {
                return Ok(EventPage {
                    events: result,
                    cursor: checkpoint.clone(),
                });
            }
        }

        Ok(EventPage {
            events: result,
            cursor: query.to.clone(),
        })
    }

    async fn get_child_addresses(
        &self,
        chain_id: u64,
        factory: &Factory,
        to_block: u64,
    ) -> Result<Vec<String>, SyncError> {
        let tables = self.tables();
        Ok(tables.child_index(&[factory], chain_id).addresses(factory, to_block))
    }

    async fn insert_rpc_request_result(
        &self,
        chain_id: u64,
        block_number: u64,
        request: &str,
        result: &str,
    ) -> Result<(), SyncError> {
        self.tables()
            .chain(chain_id)
            .rpc_results
            .insert(request.to_string(), (block_number, result.to_string()));
        Ok(())
    }

    async fn get_rpc_request_result(
        &self,
        chain_id: u64,
        request: &str,
    ) -> Result<Option<String>, SyncError> {
        Ok(self
            .tables()
            .chains
            .get(&chain_id)
            .and_then(|chain| chain.rpc_results.get(request))
            .map(|(_, result)| result.clone()))
    }

    async fn prune_rpc_request_result(
        &self,
        chain_id: u64,
        block_numbers: &[u64],
    ) -> Result<(), SyncError> {
        if let Some(chain) = self.tables().chains.get_mut(&chain_id) {
            chain
                .rpc_results
                .retain(|_, (block, _)| !block_numbers.contains(block));
        }
        Ok(())
    }

    async fn prune_by_chain(&self, chain_id: u64, from_block: u64) -> Result<(), SyncError> {
        let mut tables = self.tables();
        tables
            .events
            .retain(|_, (chain, _)| *chain != chain_id);
        let Some(chain) = tables.chains.get_mut(&chain_id) else {
            return Ok(());
        };
        chain.blocks.retain(|number, _| *number < from_block);
        chain.logs.retain(|_, r| r.log.block_number < from_block);
        chain.transactions.retain(|_, t| t.block_number < from_block);
        chain.receipts.retain(|_, r| r.block_number < from_block);
        chain.traces.retain(|(number, _, _), _| *number < from_block);
        chain.rpc_results.retain(|_, (number, _)| *number < from_block);
        for stored in chain.intervals.values_mut() {
            *stored = match from_block.checked_sub(1) {
                Some(last) => interval::intersection(stored, &[(0, last)]),
                None => Vec::new(),
            };
        }

        let kept: Vec<(String, String)> = chain
            .logs
            .iter()
            .filter_map(|(id, r)| r.checkpoint.clone().map(|cp| (cp, id.clone())))
            .collect();
        for (checkpoint, id) in kept {
            tables.events.insert(checkpoint, (chain_id, id));
        }
        debug!(chain_id, from_block, "pruned chain data");
        Ok(())
    }
}
