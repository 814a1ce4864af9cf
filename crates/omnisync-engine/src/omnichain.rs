//! Cross-chain state: per-chain progress, unfinalized buffers and the
//! pending / executed event queues that order realtime delivery.
//!
//! Every mutation goes through one of the `apply_*` transitions below. The
//! state lives behind a synchronous mutex in the coordinator and none of the
//! transitions await, so the lock is never held across a suspension point.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use omnisync_core::checkpoint::{Checkpoint, Rounding};
use omnisync_core::config::NetworkConfig;
use omnisync_core::error::SyncError;
use omnisync_core::filter::{Factory, Source};
use omnisync_core::interval::{self, Interval};
use omnisync_core::progress::{ProgressTag, SyncProgress};
use omnisync_core::store::{LogRecord, SyncBatch};
use omnisync_core::types::{LightBlock, RawEvent, UnfinalizedBlock};

use crate::consumer::{ChainStatus, EventBatch, RealtimeEvent, Status, StatusBlock};
use crate::factory::ChildAddresses;

/// Everything the coordinator tracks for one chain.
#[derive(Debug, Clone)]
pub struct ChainState {
    pub network: NetworkConfig,
    pub sources: Vec<Source>,
    pub factories: Vec<Factory>,
    pub progress: SyncProgress,
    /// Realtime blocks above the finalized block, oldest first.
    pub unfinalized_blocks: Vec<UnfinalizedBlock>,
    pub child_addresses: ChildAddresses,
}

impl ChainState {
    pub fn new(network: NetworkConfig, sources: Vec<Source>, progress: SyncProgress) -> Self {
        let mut factories: Vec<Factory> = Vec::new();
        for factory in sources.iter().filter_map(|s| s.filter.factory_ref()) {
            if !factories.contains(factory) {
                factories.push(factory.clone());
            }
        }
        Self {
            network,
            sources,
            factories,
            progress,
            unfinalized_blocks: Vec::new(),
            child_addresses: ChildAddresses::new(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.network.chain_id
    }

    pub fn checkpoint(&self, tag: ProgressTag) -> Option<String> {
        self.progress.checkpoint(self.chain_id(), tag)
    }

    /// `true` once the configured end block is finalized.
    pub fn reached_end(&self) -> bool {
        self.progress
            .end
            .as_ref()
            .is_some_and(|end| self.progress.finalized.number >= end.number)
    }

    /// Events of one realtime block, ordered by checkpoint then source.
    fn block_events(&self, block: &UnfinalizedBlock) -> Result<Vec<RawEvent>, SyncError> {
        let chain_id = self.chain_id();
        let light = block.light();
        let header = block.block.without_transactions();
        let mut events = Vec::new();
        for log in &block.logs {
            let matched: Vec<&Source> = self
                .sources
                .iter()
                .filter(|s| {
                    s.filter
                        .matches(log, |factory, address| self.child_addresses.contains(factory, address))
                })
                .collect();
            if matched.is_empty() {
                continue;
            }
            let checkpoint = log.checkpoint(&light, chain_id)?.encode();
            let transaction = block
                .transactions
                .iter()
                .find(|t| t.hash == log.transaction_hash)
                .ok_or_else(|| {
                    SyncError::malformed(
                        chain_id,
                        format!("transaction {} of log {} is missing", log.transaction_hash, log.id()),
                    )
                })?;
            events.extend(matched.into_iter().map(|source| RawEvent {
                chain_id,
                source_id: source.name.clone(),
                checkpoint: checkpoint.clone(),
                log: log.clone(),
                block: header.clone(),
                transaction: transaction.clone(),
            }));
        }
        events.sort_by(|a, b| a.checkpoint.cmp(&b.checkpoint));
        Ok(events)
    }
}

/// What a finalize transition produced.
#[derive(Debug)]
pub struct FinalizeOutcome {
    /// Data to persist for the newly finalized range.
    pub batch: SyncBatch,
    /// Set when the omnichain finalized checkpoint advanced.
    pub event: Option<RealtimeEvent>,
    /// The chain's end block is now finalized; its realtime sync can stop.
    pub reached_end: bool,
}

/// What a reorg transition produced.
#[derive(Debug)]
pub struct ReorgOutcome {
    pub event: RealtimeEvent,
    /// Numbers of the dropped blocks, for pruning cached RPC results.
    pub reorged_block_numbers: Vec<u64>,
}

/// State shared by every chain.
#[derive(Debug, Default)]
pub struct OmnichainState {
    pub chains: BTreeMap<u64, ChainState>,
    /// Realtime events not yet delivered.
    pub pending_events: Vec<RawEvent>,
    /// Delivered realtime events that may still be reorged.
    pub executed_events: Vec<RawEvent>,
    pub status: Status,
}

impl OmnichainState {
    pub fn new(chains: impl IntoIterator<Item = ChainState>) -> Self {
        let chains: BTreeMap<u64, ChainState> =
            chains.into_iter().map(|c| (c.chain_id(), c)).collect();
        let status = chains
            .values()
            .map(|c| (c.network.name.clone(), ChainStatus::default()))
            .collect();
        Self {
            chains,
            pending_events: Vec::new(),
            executed_events: Vec::new(),
            status,
        }
    }

    fn chain_mut(&mut self, chain_id: u64) -> Result<&mut ChainState, SyncError> {
        self.chains
            .get_mut(&chain_id)
            .ok_or_else(|| SyncError::Other(format!("unknown chain {chain_id}")))
    }

    /// Minimum checkpoint over every chain for `tag`.
    ///
    /// `End` is `None` if any chain is open-ended; `Current` is `None` only
    /// when no chain has one.
    pub fn omnichain_checkpoint(&self, tag: ProgressTag) -> Option<String> {
        let checkpoints: Vec<Option<String>> =
            self.chains.values().map(|c| c.checkpoint(tag)).collect();
        if tag == ProgressTag::End && checkpoints.iter().any(Option::is_none) {
            return None;
        }
        checkpoints.into_iter().flatten().min()
    }

    /// A chain's realtime block arrived.
    pub fn apply_block(
        &mut self,
        chain_id: u64,
        block: UnfinalizedBlock,
    ) -> Result<Option<RealtimeEvent>, SyncError> {
        let before = self.omnichain_checkpoint(ProgressTag::Current);
        let chain = self.chain_mut(chain_id)?;
        chain.progress.current = Some(block.light());
        let number = block.number();
        let factories = chain.factories.clone();
        chain.child_addresses.record(number, &factories, &block.factory_logs);
        let events = chain.block_events(&block)?;
        chain.unfinalized_blocks.push(block);
        self.pending_events.extend(events);

        let after = self.omnichain_checkpoint(ProgressTag::Current);
        let Some(to) = after.filter(|after| Some(after) > before.as_ref()) else {
            debug!(chain_id, block = number, "omnichain checkpoint unchanged");
            return Ok(None);
        };

        self.update_realtime_status(&to);
        let (mut ready, pending): (Vec<RawEvent>, Vec<RawEvent>) = self
            .pending_events
            .drain(..)
            .partition(|e| e.checkpoint <= to);
        self.pending_events = pending;
        ready.sort_by(|a, b| a.checkpoint.cmp(&b.checkpoint));
        self.executed_events.extend(ready.iter().cloned());

        Ok(Some(RealtimeEvent::Block {
            checkpoint: to,
            status: self.status.clone(),
            events: ready,
        }))
    }

    /// A chain's finalized block moved to `block`.
    pub fn apply_finalize(
        &mut self,
        chain_id: u64,
        block: LightBlock,
    ) -> Result<FinalizeOutcome, SyncError> {
        let prev = self.omnichain_checkpoint(ProgressTag::Finalized);
        let chain = self.chain_mut(chain_id)?;
        let range: Interval = (chain.progress.finalized.number, block.number);
        chain.progress.finalized = block.clone();
        let chain_finalized = chain.checkpoint(ProgressTag::Finalized);
        let checkpoint = self.omnichain_checkpoint(ProgressTag::Finalized);

        let current = self.omnichain_checkpoint(ProgressTag::Current);
        if current.is_some() && chain_finalized > current {
            warn!(chain_id, finalized = block.number, "finalized block surpassed the omnichain checkpoint");
        }

        let chain = self.chain_mut(chain_id)?;
        let split = chain
            .unfinalized_blocks
            .partition_point(|b| b.number() <= block.number);
        let finalized: Vec<UnfinalizedBlock> = chain.unfinalized_blocks.drain(..split).collect();
        chain.child_addresses.finalize(block.number);

        let mut batch = SyncBatch::new(chain_id);
        for unfinalized in finalized {
            let light = unfinalized.light();
            if unfinalized.has_matched_filter {
                batch.blocks.push(unfinalized.block.without_transactions());
            }
            for log in unfinalized.logs {
                let cp = log.checkpoint(&light, chain_id)?.encode();
                batch.logs.push(LogRecord::event(log, cp));
            }
            batch
                .logs
                .extend(unfinalized.factory_logs.into_iter().map(LogRecord::factory));
            batch.transactions.extend(unfinalized.transactions);
            batch.transaction_receipts.extend(unfinalized.transaction_receipts);
            batch.traces.extend(unfinalized.traces);
        }
        if !chain.network.disable_cache {
            for source in &chain.sources {
                for synced in interval::intersection(&[range], &[source.filter.block_range()]) {
                    for fragment in source.filter.fragments() {
                        batch.intervals.push((fragment, synced));
                    }
                }
            }
        }
        let reached_end = chain.reached_end();

        if let Some(checkpoint) = &checkpoint {
            self.executed_events.retain(|e| &e.checkpoint > checkpoint);
        }

        let event = match checkpoint {
            Some(checkpoint) if Some(&checkpoint) > prev.as_ref() => {
                Some(RealtimeEvent::Finalize { checkpoint })
            }
            _ => None,
        };
        Ok(FinalizeOutcome {
            batch,
            event,
            reached_end,
        })
    }

    /// A chain reorged back to `ancestor`.
    pub fn apply_reorg(
        &mut self,
        chain_id: u64,
        ancestor: LightBlock,
        reorged_blocks: &[LightBlock],
    ) -> Result<ReorgOutcome, SyncError> {
        let chain = self.chain_mut(chain_id)?;
        let finalized = chain.progress.finalized.number;
        if ancestor.number < finalized {
            return Err(SyncError::ReorgTooDeep {
                chain_id,
                ancestor: ancestor.number,
                finalized,
            });
        }

        let number = ancestor.number;
        chain.progress.current = Some(ancestor);
        chain.unfinalized_blocks.retain(|b| b.number() <= number);
        chain.child_addresses.rollback(number);

        let checkpoint = self
            .omnichain_checkpoint(ProgressTag::Current)
            .ok_or_else(|| SyncError::Other("no chain has a current block".into()))?;

        let reorged = |e: &RawEvent| e.chain_id == chain_id && e.block.number > number;
        self.pending_events.retain(|e| !reorged(e));
        self.executed_events.retain(|e| !reorged(e));

        let (keep, retract): (Vec<RawEvent>, Vec<RawEvent>) = self
            .executed_events
            .drain(..)
            .partition(|e| e.checkpoint <= checkpoint);
        self.executed_events = keep;
        self.pending_events.extend(retract);

        debug!(chain_id, ancestor = number, depth = reorged_blocks.len(), "applied reorg");
        Ok(ReorgOutcome {
            event: RealtimeEvent::Reorg { checkpoint },
            reorged_block_numbers: reorged_blocks.iter().map(|b| b.number).collect(),
        })
    }

    /// Switch a chain to realtime: mark it ready, queue the stored events it
    /// still owes, and seed its child addresses.
    pub fn start_realtime(
        &mut self,
        chain_id: u64,
        pending: Vec<RawEvent>,
        child_addresses: ChildAddresses,
    ) -> Result<(), SyncError> {
        let chain = self.chain_mut(chain_id)?;
        chain.child_addresses = child_addresses;
        let name = chain.network.name.clone();
        let block = chain.progress.current.as_ref().map(|c| StatusBlock {
            number: c.number,
            timestamp: c.timestamp,
        });
        self.pending_events.extend(pending);
        let status = self.status.entry(name).or_default();
        if block.is_some() {
            status.block = block;
        }
        status.ready = true;
        Ok(())
    }

    /// Historical status: from `cursor` for its own chain, otherwise from the
    /// chain's last event in the batch.
    pub fn update_historical_status(&mut self, events: &[RawEvent], cursor: &str) {
        let cursor = Checkpoint::decode(cursor).ok();
        for chain in self.chains.values() {
            let decoded = match &cursor {
                Some(c) if c.chain_id == chain.chain_id() => Some(*c),
                _ => events
                    .iter()
                    .rev()
                    .find(|e| e.chain_id == chain.chain_id())
                    .and_then(|e| Checkpoint::decode(&e.checkpoint).ok()),
            };
            if let Some(c) = decoded {
                self.status.entry(chain.network.name.clone()).or_default().block = Some(StatusBlock {
                    number: c.block_number,
                    timestamp: c.block_timestamp,
                });
            }
        }
    }

    /// Realtime status: each chain's newest unfinalized block at or below
    /// `checkpoint`.
    fn update_realtime_status(&mut self, checkpoint: &str) {
        for chain in self.chains.values() {
            let latest = chain.unfinalized_blocks.iter().rev().find(|b| {
                Checkpoint::for_block(&b.light(), chain.chain_id(), Rounding::Up).encode().as_str()
                    <= checkpoint
            });
            if let Some(block) = latest {
                self.status.entry(chain.network.name.clone()).or_default().block = Some(StatusBlock {
                    number: block.number(),
                    timestamp: block.block.timestamp,
                });
            }
        }
    }
}

/// Group ordered events into per-block batches, each carrying its block's
/// rounded-up checkpoint.
pub fn split_events(events: Vec<RawEvent>) -> Vec<EventBatch> {
    let mut batches: Vec<EventBatch> = Vec::new();
    let mut key = None;
    for event in events {
        let this = (event.chain_id, event.block.number);
        if key != Some(this) {
            key = Some(this);
            batches.push(EventBatch {
                events: Vec::new(),
                checkpoint: Checkpoint::for_block(&event.block.light(), event.chain_id, Rounding::Up)
                    .encode(),
            });
        }
        if let Some(batch) = batches.last_mut() {
            batch.events.push(event);
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnisync_core::filter::{ChildAddressLocation, LogFilter};
    use omnisync_core::types::{Block, Log, Transaction};

    const TOKEN: &str = "0xaa";

    fn light(chain_id: u64, number: u64) -> LightBlock {
        LightBlock {
            number,
            hash: format!("0x{chain_id}-{number}"),
            parent_hash: format!("0x{chain_id}-{}", number.saturating_sub(1)),
            timestamp: 1_000 + number * 10 + chain_id,
        }
    }

    fn unfinalized(chain_id: u64, number: u64, emitters: &[&str]) -> UnfinalizedBlock {
        let l = light(chain_id, number);
        let mut logs = Vec::new();
        let mut transactions = Vec::new();
        for (i, emitter) in emitters.iter().enumerate() {
            let tx = format!("0xtx{chain_id}-{number}-{i}");
            transactions.push(Transaction {
                hash: tx.clone(),
                block_number: number,
                block_hash: l.hash.clone(),
                transaction_index: i as u32,
                from: "0xf".into(),
                to: Some(emitter.to_string()),
                input: "0x".into(),
                value: "0".into(),
            });
            logs.push(Log {
                address: emitter.to_string(),
                topics: vec!["0x0d36".into(), format!("0x{}{}", "0".repeat(24), "cd".repeat(20))],
                data: "0x".into(),
                block_number: number,
                block_hash: l.hash.clone(),
                transaction_hash: tx,
                transaction_index: Some(i as u32),
                log_index: Some(i as u32),
            });
        }
        UnfinalizedBlock {
            block: Block {
                number,
                hash: l.hash,
                parent_hash: l.parent_hash,
                timestamp: l.timestamp,
                miner: "0x0".into(),
                gas_used: 0,
                gas_limit: 0,
                base_fee_per_gas: None,
                transactions: transactions.clone(),
            },
            has_matched_filter: !logs.is_empty(),
            logs,
            factory_logs: Vec::new(),
            transactions,
            transaction_receipts: Vec::new(),
            traces: Vec::new(),
        }
    }

    fn chain(chain_id: u64, name: &str, current: u64, end: Option<u64>) -> ChainState {
        ChainState::new(
            NetworkConfig::new(name, chain_id),
            vec![Source::new(format!("token-{chain_id}"), LogFilter::address(chain_id, TOKEN))],
            SyncProgress {
                start: light(chain_id, 0),
                end: end.map(|e| light(chain_id, e)),
                finalized: light(chain_id, current),
                cached: None,
                current: Some(light(chain_id, current)),
            },
        )
    }

    fn two_chains() -> OmnichainState {
        OmnichainState::new([chain(1, "one", 10, None), chain(2, "two", 10, None)])
    }

    #[test]
    fn omnichain_checkpoint_is_minimum() {
        let state = two_chains();
        let current = state.omnichain_checkpoint(ProgressTag::Current).unwrap();
        assert_eq!(current, state.chains[&1].checkpoint(ProgressTag::Current).unwrap());
        assert!(state.omnichain_checkpoint(ProgressTag::End).is_none());

        let ended = OmnichainState::new([chain(1, "one", 10, Some(10)), chain(2, "two", 10, Some(20))]);
        // Chain 1 reached its end: only chain 2 bounds the current checkpoint.
        let current = ended.omnichain_checkpoint(ProgressTag::Current).unwrap();
        assert_eq!(current, ended.chains[&2].checkpoint(ProgressTag::Current).unwrap());
        assert!(ended.omnichain_checkpoint(ProgressTag::End).is_some());
    }

    #[test]
    fn block_waits_for_slowest_chain() {
        let mut state = two_chains();
        // Chain 1 moves ahead; chain 2 now bounds the checkpoint, so chain 1's
        // event stays pending.
        let first = state.apply_block(1, unfinalized(1, 11, &[TOKEN])).unwrap().unwrap();
        assert!(matches!(first, RealtimeEvent::Block { ref events, .. } if events.is_empty()));
        assert_eq!(state.pending_events.len(), 1);

        let event = state.apply_block(2, unfinalized(2, 11, &[TOKEN])).unwrap().unwrap();
        match event {
            RealtimeEvent::Block { events, status, checkpoint } => {
                // Chain 1's block 11 is older than chain 2's block 11.
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].chain_id, 1);
                assert_eq!(status["one"].block.unwrap().number, 11);
                assert_eq!(checkpoint, state.chains[&1].checkpoint(ProgressTag::Current).unwrap());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state.executed_events.len(), 1);
        assert_eq!(state.pending_events.len(), 1);
    }

    #[test]
    fn finalize_builds_batch_and_prunes_executed() {
        let mut state = OmnichainState::new([chain(1, "one", 10, None)]);
        for n in 11..=14 {
            state.apply_block(1, unfinalized(1, n, if n % 2 == 0 { &[TOKEN] } else { &[] })).unwrap();
        }
        assert_eq!(state.executed_events.len(), 2);

        let outcome = state.apply_finalize(1, light(1, 12)).unwrap();
        assert_eq!(outcome.batch.blocks.len(), 1);
        assert_eq!(outcome.batch.logs.len(), 1);
        assert!(outcome.batch.logs[0].checkpoint.is_some());
        let fragments = state.chains[&1].sources[0].filter.fragments();
        assert_eq!(outcome.batch.intervals, vec![(fragments[0].clone(), (10, 12))]);
        assert!(matches!(outcome.event, Some(RealtimeEvent::Finalize { .. })));
        assert!(!outcome.reached_end);

        assert_eq!(state.chains[&1].unfinalized_blocks.len(), 2);
        assert_eq!(state.executed_events.len(), 1);
        assert_eq!(state.executed_events[0].block.number, 14);
    }

    #[test]
    #[tracing_test::traced_test]
    fn finalize_ahead_of_current_warns() {
        let mut state = OmnichainState::new([chain(1, "one", 10, None)]);
        state.apply_finalize(1, light(1, 12)).unwrap();
        assert!(logs_contain("finalized block surpassed the omnichain checkpoint"));
    }

    #[test]
    #[tracing_test::traced_test]
    fn finalize_before_any_current_is_quiet() {
        let mut c = chain(1, "one", 10, None);
        c.progress.current = None;
        let mut state = OmnichainState::new([c]);
        state.apply_finalize(1, light(1, 12)).unwrap();
        assert!(!logs_contain("finalized block surpassed"));
    }

    #[test]
    fn finalize_skips_intervals_without_cache() {
        let mut c = chain(1, "one", 10, Some(12));
        c.network.disable_cache = true;
        let mut state = OmnichainState::new([c]);
        state.apply_block(1, unfinalized(1, 11, &[TOKEN])).unwrap();
        state.apply_block(1, unfinalized(1, 12, &[TOKEN])).unwrap();
        let outcome = state.apply_finalize(1, light(1, 12)).unwrap();
        assert!(outcome.batch.intervals.is_empty());
        assert!(outcome.reached_end);
    }

    #[test]
    fn reorg_retracts_and_drops() {
        let mut state = OmnichainState::new([chain(1, "one", 0, None)]);
        for n in 1..=10 {
            state.apply_block(1, unfinalized(1, n, &[TOKEN])).unwrap();
        }
        assert_eq!(state.executed_events.len(), 10);

        let reorged: Vec<LightBlock> = (8..=10).map(|n| light(1, n)).collect();
        let outcome = state.apply_reorg(1, light(1, 7), &reorged).unwrap();
        let block7 = Checkpoint::for_block(&light(1, 7), 1, Rounding::Up).encode();
        match &outcome.event {
            RealtimeEvent::Reorg { checkpoint } => assert!(checkpoint <= &block7),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(outcome.reorged_block_numbers, vec![8, 9, 10]);
        assert_eq!(state.chains[&1].progress.current.as_ref().unwrap().number, 7);
        assert_eq!(state.chains[&1].unfinalized_blocks.len(), 7);
        assert_eq!(state.executed_events.len(), 7);
        assert!(state.pending_events.is_empty());
    }

    #[test]
    fn reorg_moves_other_chains_events_back_to_pending() {
        let mut state = two_chains();
        state.apply_block(1, unfinalized(1, 11, &[TOKEN])).unwrap();
        state.apply_block(1, unfinalized(1, 12, &[TOKEN])).unwrap();
        state.apply_block(2, unfinalized(2, 12, &[TOKEN])).unwrap();
        assert_eq!(state.executed_events.len(), 2);
        assert_eq!(state.pending_events.len(), 1);

        // Chain 2 rewinds to 10: its own event is dropped and chain 1's
        // delivered events are no longer safe.
        state.apply_reorg(2, light(2, 10), &[light(2, 12)]).unwrap();
        assert!(state.executed_events.is_empty());
        assert_eq!(state.pending_events.len(), 2);
        assert!(state.pending_events.iter().all(|e| e.chain_id == 1));
    }

    #[test]
    fn reorg_below_finalized_is_rejected() {
        let mut state = OmnichainState::new([chain(1, "one", 10, None)]);
        let err = state.apply_reorg(1, light(1, 9), &[]).unwrap_err();
        assert!(matches!(err, SyncError::ReorgTooDeep { ancestor: 9, finalized: 10, .. }));
    }

    #[test]
    fn factory_events_need_known_children() {
        let factory = Factory {
            address: "0xfac".into(),
            event_selector: "0x0d36".into(),
            child_address_location: ChildAddressLocation::Topic(1),
        };
        let child = format!("0x{}", "cd".repeat(20));
        let base = chain(1, "one", 0, None);
        let c = ChainState::new(
            base.network,
            vec![Source::new("pairs", LogFilter::factory(1, factory))],
            base.progress,
        );
        let mut state = OmnichainState::new([c]);

        assert!(state.apply_block(1, unfinalized(1, 1, &[&child])).unwrap().is_some());
        assert!(state.executed_events.is_empty());

        let mut creation = unfinalized(1, 2, &[]);
        creation.factory_logs = unfinalized(1, 2, &["0xFAC"]).logs;
        state.apply_block(1, creation).unwrap();
        state.apply_block(1, unfinalized(1, 3, &[&child])).unwrap();
        assert_eq!(state.executed_events.len(), 1);
        assert_eq!(state.executed_events[0].block.number, 3);
    }

    #[test]
    fn historical_status_from_cursor_and_events() {
        let mut state = two_chains();
        let events = vec![RawEvent {
            chain_id: 2,
            source_id: "token-2".into(),
            checkpoint: Checkpoint::for_block(&light(2, 5), 2, Rounding::Down).encode(),
            log: unfinalized(2, 5, &[TOKEN]).logs.remove(0),
            block: unfinalized(2, 5, &[]).block,
            transaction: unfinalized(2, 5, &[TOKEN]).transactions.remove(0),
        }];
        let cursor = Checkpoint::for_block(&light(1, 7), 1, Rounding::Up).encode();
        state.update_historical_status(&events, &cursor);
        assert_eq!(state.status["one"].block.unwrap().number, 7);
        assert_eq!(state.status["two"].block.unwrap().number, 5);
    }

    #[test]
    fn start_realtime_marks_ready() {
        let mut state = two_chains();
        state.start_realtime(1, Vec::new(), ChildAddresses::new()).unwrap();
        assert!(state.status["one"].ready);
        assert_eq!(state.status["one"].block.unwrap().number, 10);
        assert!(!state.status["two"].ready);
    }

    #[test]
    fn split_events_groups_by_block() {
        let mut state = OmnichainState::new([chain(1, "one", 0, None)]);
        let mut all = Vec::new();
        for n in 1..=3 {
            if let Some(RealtimeEvent::Block { events, .. }) =
                state.apply_block(1, unfinalized(1, n, &[TOKEN, TOKEN])).unwrap()
            {
                all.extend(events);
            }
        }
        let batches = split_events(all);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.events.len() == 2));
        assert_eq!(
            batches[1].checkpoint,
            Checkpoint::for_block(&light(1, 2), 1, Rounding::Up).encode()
        );
    }
}
