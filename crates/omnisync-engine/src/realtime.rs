//! Realtime tip polling.
//!
//! [`RealtimeSync`] follows one chain's tip, turning what it sees into
//! [`RealtimeSyncEvent`]s:
//!
//! - **Block**: a new block extending the local head, with every log that
//!   may match a source and every factory creation log in it.
//! - **Finalize**: the tip moved more than twice the finality depth past the
//!   finalized block; the block `finality_block_count` below the tip becomes
//!   the new finalized block.
//! - **Reorg**: a fetched block does not extend the local head (or the tip
//!   has a different hash at a known height). The poller walks back to the
//!   common ancestor and reports every dropped block.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use omnisync_core::client::{BlockSelector, ChainClient, LogQuery};
use omnisync_core::config::NetworkConfig;
use omnisync_core::error::SyncError;
use omnisync_core::filter::{Factory, Source};
use omnisync_core::types::{Block, LightBlock, Log, UnfinalizedBlock};

use crate::tracker::BlockTracker;

/// Consecutive transient poll failures tolerated before the chain is halted.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;

/// What the poller observed on one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeSyncEvent {
    Block(Box<UnfinalizedBlock>),
    Finalize(LightBlock),
    Reorg {
        ancestor: LightBlock,
        /// Dropped blocks, oldest first.
        reorged_blocks: Vec<LightBlock>,
    },
}

/// Tip poller for one chain.
pub struct RealtimeSync {
    network: NetworkConfig,
    client: Arc<dyn ChainClient>,
    sources: Vec<Source>,
    factories: Vec<Factory>,
    tracker: BlockTracker,
    /// Events produced by a poll that failed part way, handed out first by
    /// the next poll.
    buffered: Vec<RealtimeSyncEvent>,
}

impl RealtimeSync {
    /// Start following the chain above `finalized`.
    pub fn new(
        network: NetworkConfig,
        client: Arc<dyn ChainClient>,
        sources: Vec<Source>,
        finalized: LightBlock,
    ) -> Self {
        let mut factories: Vec<Factory> = Vec::new();
        for factory in sources.iter().filter_map(|s| s.filter.factory_ref()) {
            if !factories.contains(factory) {
                factories.push(factory.clone());
            }
        }
        Self {
            network,
            client,
            sources,
            factories,
            tracker: BlockTracker::new(finalized),
            buffered: Vec::new(),
        }
    }

    fn chain_id(&self) -> u64 {
        self.network.chain_id
    }

    pub fn head(&self) -> &LightBlock {
        self.tracker.head()
    }

    pub fn finalized(&self) -> &LightBlock {
        self.tracker.finalized()
    }

    /// Poll the tip once and return what changed, in order.
    ///
    /// On error, the events observed before the failure are kept and
    /// returned ahead of the next poll's events.
    pub async fn poll(&mut self) -> Result<Vec<RealtimeSyncEvent>, SyncError> {
        let mut events = std::mem::take(&mut self.buffered);
        match self.poll_into(&mut events).await {
            Ok(()) => Ok(events),
            Err(e) => {
                self.buffered = events;
                Err(e)
            }
        }
    }

    async fn poll_into(&mut self, events: &mut Vec<RealtimeSyncEvent>) -> Result<(), SyncError> {
        let latest = self
            .client
            .get_block(BlockSelector::Latest)
            .await?
            .ok_or_else(|| SyncError::Rpc(format!("chain {} has no latest block", self.chain_id())))?
            .light();

        let head = self.tracker.head().clone();
        if latest.hash == head.hash {
            return Ok(());
        }

        if latest.number <= head.number {
            let known = self
                .tracker
                .get(latest.number)
                .is_some_and(|b| b.hash == latest.hash);
            if known {
                debug!(chain_id = self.chain_id(), latest = latest.number, head = head.number, "tip behind local head");
            } else {
                events.push(self.reconcile().await?);
            }
            return Ok(());
        }

        let mut next = head.number + 1;
        while next <= latest.number {
            let block = self
                .client
                .get_block(BlockSelector::Number(next))
                .await?
                .ok_or_else(|| SyncError::Rpc(format!("block {next} not found on chain {}", self.chain_id())))?;

            // The block is tracked only once everything in it was fetched.
            let light = block.light();
            let unfinalized = self.ingest(block).await?;
            match self.tracker.push(light) {
                Ok(()) => {
                    events.push(RealtimeSyncEvent::Block(Box::new(unfinalized)));
                    if let Some(finalized) = self.maybe_finalize() {
                        events.push(RealtimeSyncEvent::Finalize(finalized));
                    }
                    next += 1;
                }
                Err(depth) => {
                    warn!(chain_id = self.chain_id(), block = next, depth, "parent hash mismatch");
                    let reorg = self.reconcile().await?;
                    if let RealtimeSyncEvent::Reorg { ancestor, .. } = &reorg {
                        next = ancestor.number + 1;
                    }
                    events.push(reorg);
                }
            }
        }
        Ok(())
    }

    /// Walk the local chain back until a block matches the remote chain.
    async fn reconcile(&mut self) -> Result<RealtimeSyncEvent, SyncError> {
        let chain_id = self.chain_id();
        let local: Vec<LightBlock> = self.tracker.unfinalized().rev().cloned().collect();
        let mut ancestor = None;
        for block in &local {
            let remote = self.client.get_block(BlockSelector::Number(block.number)).await?;
            if remote.is_some_and(|r| r.hash == block.hash) {
                ancestor = Some(block.clone());
                break;
            }
        }

        let ancestor = match ancestor {
            Some(ancestor) => ancestor,
            None => {
                let finalized = self.tracker.finalized().clone();
                let remote = self
                    .client
                    .get_block(BlockSelector::Number(finalized.number))
                    .await?;
                if !remote.is_some_and(|r| r.hash == finalized.hash) {
                    error!(chain_id, finalized = finalized.number, "reorg below the finalized block");
                    return Err(SyncError::ReorgTooDeep {
                        chain_id,
                        ancestor: finalized.number.saturating_sub(1),
                        finalized: finalized.number,
                    });
                }
                finalized
            }
        };

        let reorged_blocks = self.tracker.rewind_to(ancestor.number);
        info!(
            chain_id,
            ancestor = ancestor.number,
            depth = reorged_blocks.len(),
            "reorg detected"
        );
        Ok(RealtimeSyncEvent::Reorg {
            ancestor,
            reorged_blocks,
        })
    }

    fn maybe_finalize(&mut self) -> Option<LightBlock> {
        let finality = self.network.finality_block_count;
        let head = self.tracker.head().number;
        let finalized = self.tracker.finalized().number;
        if head.saturating_sub(finalized) <= finality.saturating_mul(2) {
            return None;
        }
        let block = self.tracker.finalize(head - finality)?;
        debug!(chain_id = self.chain_id(), finalized = block.number, "finalized");
        Some(block)
    }

    /// Collect everything in `block` the sources may need.
    async fn ingest(&self, block: Block) -> Result<UnfinalizedBlock, SyncError> {
        let chain_id = self.chain_id();
        let number = block.number;

        let mut logs: BTreeMap<String, Log> = BTreeMap::new();
        let mut receipt_hashes = BTreeSet::new();
        let mut trace_hashes = HashSet::new();
        for source in &self.sources {
            if !source.filter.contains_block(number) {
                continue;
            }
            let fetched = self
                .client
                .get_logs(&LogQuery::for_filter(&source.filter, number, number))
                .await?;
            for log in fetched.into_iter().filter(|l| source.filter.matches_candidate(l)) {
                if source.filter.include_transaction_receipts {
                    receipt_hashes.insert(log.transaction_hash.clone());
                }
                if source.filter.include_call_traces {
                    trace_hashes.insert(log.transaction_hash.clone());
                }
                logs.entry(log.id()).or_insert(log);
            }
        }

        let mut factory_logs: BTreeMap<String, Log> = BTreeMap::new();
        for factory in &self.factories {
            for log in self
                .client
                .get_logs(&LogQuery::for_factory(factory, number, number))
                .await?
            {
                factory_logs.entry(log.id()).or_insert(log);
            }
        }

        let logs: Vec<Log> = logs.into_values().collect();
        let factory_logs: Vec<Log> = factory_logs.into_values().collect();
        if let Some(stray) = logs.iter().chain(&factory_logs).find(|l| l.block_hash != block.hash) {
            return Err(SyncError::Rpc(format!(
                "log {} does not belong to block {number} ({})",
                stray.id(),
                block.hash
            )));
        }

        let mut transactions = Vec::new();
        let mut seen = HashSet::new();
        for log in &logs {
            if !seen.insert(log.transaction_hash.as_str()) {
                continue;
            }
            let transaction = block.transaction(&log.transaction_hash).ok_or_else(|| {
                SyncError::malformed(
                    chain_id,
                    format!("transaction {} of log {} is missing", log.transaction_hash, log.id()),
                )
            })?;
            transactions.push(transaction.clone());
        }

        let mut transaction_receipts = Vec::with_capacity(receipt_hashes.len());
        for hash in receipt_hashes {
            let receipt = self
                .client
                .get_transaction_receipt(&hash)
                .await?
                .ok_or_else(|| SyncError::malformed(chain_id, format!("receipt {hash} is missing")))?;
            transaction_receipts.push(receipt);
        }

        let traces = if trace_hashes.is_empty() {
            Vec::new()
        } else {
            self.client
                .get_block_traces(number)
                .await?
                .into_iter()
                .filter(|t| trace_hashes.contains(&t.transaction_hash))
                .collect()
        };

        let has_matched_filter = !logs.is_empty() || !factory_logs.is_empty();
        debug!(chain_id, block = number, logs = logs.len(), factory_logs = factory_logs.len(), "block ingested");
        Ok(UnfinalizedBlock {
            block,
            logs,
            factory_logs,
            transactions,
            transaction_receipts,
            traces,
            has_matched_filter,
        })
    }

    /// Poll until killed, sending events (or the fatal error) into `sender`.
    pub async fn run(
        mut self,
        sender: mpsc::Sender<Result<RealtimeSyncEvent, SyncError>>,
        mut kill: watch::Receiver<bool>,
    ) {
        let chain_id = self.chain_id();
        let interval = Duration::from_millis(self.network.poll_interval_ms);
        let mut failures = 0u32;
        info!(chain_id, network = %self.network.name, head = self.head().number, "realtime sync started");

        loop {
            if *kill.borrow() {
                break;
            }
            let polled = tokio::select! {
                _ = kill.changed() => break,
                polled = self.poll() => polled,
            };
            match polled {
                Ok(events) => {
                    failures = 0;
                    for event in events {
                        if sender.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.is_retryable() && failures < MAX_CONSECUTIVE_ERRORS => {
                    failures += 1;
                    warn!(chain_id, error = %e, failures, "realtime poll failed, retrying");
                }
                Err(e) => {
                    error!(chain_id, error = %e, "realtime sync halted");
                    let _ = sender.send(Err(e)).await;
                    return;
                }
            }

            tokio::select! {
                _ = kill.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(chain_id, "realtime sync stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_chain::{EmittedLog, InMemoryChain};
    use omnisync_core::filter::LogFilter;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";

    fn realtime(chain: &Arc<InMemoryChain>, finality: u64, finalized: u64) -> RealtimeSync {
        RealtimeSync::new(
            NetworkConfig::new("test", 1).finality_block_count(finality),
            chain.clone(),
            vec![Source::new("token", LogFilter::address(1, TOKEN))],
            chain.block(finalized).unwrap(),
        )
    }

    fn numbers(events: &[RealtimeSyncEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                RealtimeSyncEvent::Block(b) => format!("b{}", b.number()),
                RealtimeSyncEvent::Finalize(b) => format!("f{}", b.number),
                RealtimeSyncEvent::Reorg { ancestor, .. } => format!("r{}", ancestor.number),
            })
            .collect()
    }

    #[tokio::test]
    async fn blocks_arrive_in_order() {
        let chain = Arc::new(InMemoryChain::new(1));
        chain.mine_empty(5);
        let mut sync = realtime(&chain, 10, 5);

        chain.mine(vec![EmittedLog::new(TOKEN)]);
        chain.mine_empty(2);
        let events = sync.poll().await.unwrap();
        assert_eq!(numbers(&events), vec!["b6", "b7", "b8"]);
        match &events[0] {
            RealtimeSyncEvent::Block(block) => {
                assert!(block.has_matched_filter);
                assert_eq!(block.logs.len(), 1);
                assert_eq!(block.transactions.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(sync.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finalize_after_twice_finality() {
        let chain = Arc::new(InMemoryChain::new(1));
        let mut sync = realtime(&chain, 2, 0);
        chain.mine_empty(5);
        let events = sync.poll().await.unwrap();
        // Tip 5 is more than 4 past finalized 0, so block 3 is finalized.
        assert_eq!(numbers(&events), vec!["b1", "b2", "b3", "b4", "b5", "f3"]);
        assert_eq!(sync.finalized().number, 3);
    }

    #[tokio::test]
    async fn reorg_walks_back_to_ancestor() {
        let chain = Arc::new(InMemoryChain::new(1));
        let mut sync = realtime(&chain, 100, 0);
        chain.mine_empty(10);
        sync.poll().await.unwrap();

        chain.reorg(7);
        chain.mine_empty(4);
        let events = sync.poll().await.unwrap();
        assert_eq!(numbers(&events), vec!["r7", "b8", "b9", "b10", "b11"]);
        match &events[0] {
            RealtimeSyncEvent::Reorg { reorged_blocks, .. } => {
                assert_eq!(reorged_blocks.iter().map(|b| b.number).collect::<Vec<_>>(), vec![8, 9, 10]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sync.head().hash, chain.head().hash);
    }

    #[tokio::test]
    async fn equal_height_fork_is_a_reorg() {
        let chain = Arc::new(InMemoryChain::new(1));
        let mut sync = realtime(&chain, 100, 0);
        chain.mine_empty(5);
        sync.poll().await.unwrap();

        chain.reorg(3);
        chain.mine_empty(2);
        let events = sync.poll().await.unwrap();
        assert_eq!(numbers(&events), vec!["r3"]);
        assert_eq!(numbers(&sync.poll().await.unwrap()), vec!["b4", "b5"]);
    }

    #[tokio::test]
    async fn reorg_below_finalized_is_fatal() {
        let chain = Arc::new(InMemoryChain::new(1));
        chain.mine_empty(5);
        let mut sync = realtime(&chain, 100, 5);
        chain.mine_empty(2);
        sync.poll().await.unwrap();

        chain.reorg(2);
        chain.mine_empty(6);
        let err = sync.poll().await.unwrap_err();
        assert!(matches!(err, SyncError::ReorgTooDeep { finalized: 5, .. }));
    }

    #[tokio::test]
    async fn failed_poll_keeps_fetched_blocks() {
        let chain = Arc::new(InMemoryChain::new(1));
        let mut sync = realtime(&chain, 100, 0);
        chain.mine_empty(2);
        sync.poll().await.unwrap();

        for _ in 0..4 {
            chain.mine(vec![EmittedLog::new(TOKEN)]);
        }
        chain.fail_logs_at(5, 1);
        let err = sync.poll().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sync.head().number, 4);

        let events = sync.poll().await.unwrap();
        assert_eq!(numbers(&events), vec!["b3", "b4", "b5", "b6"]);
        assert!(events.iter().all(|e| matches!(e, RealtimeSyncEvent::Block(b) if b.logs.len() == 1)));
        assert_eq!(sync.head().hash, chain.head().hash);
        assert!(sync.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_kill() {
        let chain = Arc::new(InMemoryChain::new(1));
        let sync = RealtimeSync::new(
            NetworkConfig::new("test", 1).poll_interval_ms(10),
            chain.clone(),
            vec![Source::new("token", LogFilter::address(1, TOKEN))],
            chain.head(),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let (kill_tx, kill_rx) = watch::channel(false);
        let handle = tokio::spawn(sync.run(tx, kill_rx));

        chain.mine_empty(1);
        let event = rx.recv().await.unwrap().unwrap();
        assert!(matches!(event, RealtimeSyncEvent::Block(b) if b.number() == 1));

        kill_tx.send(true).unwrap();
        handle.await.unwrap();
    }
    /// Answers blocks but never returns logs.
    struct StalledLogs(Arc<InMemoryChain>);

    #[async_trait::async_trait]
    impl ChainClient for StalledLogs {
        async fn chain_id(&self) -> Result<u64, SyncError> {
            self.0.chain_id().await
        }

        async fn get_block(&self, selector: BlockSelector) -> Result<Option<Block>, SyncError> {
            self.0.get_block(selector).await
        }

        async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>, SyncError> {
            self.0.get_logs(query).await?;
            std::future::pending().await
        }

        async fn get_transaction_receipt(
            &self,
            hash: &str,
        ) -> Result<Option<omnisync_core::types::TransactionReceipt>, SyncError> {
            self.0.get_transaction_receipt(hash).await
        }

        async fn request(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, SyncError> {
            self.0.request(method, params).await
        }
    }

    #[tokio::test]
    async fn kill_interrupts_an_in_flight_poll() {
        let chain = Arc::new(InMemoryChain::new(1));
        let sync = RealtimeSync::new(
            NetworkConfig::new("test", 1).poll_interval_ms(10),
            Arc::new(StalledLogs(chain.clone())),
            vec![Source::new("token", LogFilter::address(1, TOKEN))],
            chain.head(),
        );
        let (tx, _rx) = mpsc::channel(16);
        let (kill_tx, kill_rx) = watch::channel(false);
        let handle = tokio::spawn(sync.run(tx, kill_rx));

        chain.mine_empty(1);
        while chain.log_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        kill_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not stop")
            .unwrap();
    }
}
