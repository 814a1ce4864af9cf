//! Historical backfill.
//!
//! [`HistoricalSync`] syncs one block window for every source of a chain,
//! fetching only what the interval cache says is missing and writing the
//! result as one atomic batch. [`LocalHistoricalSync`] drives it over the
//! chain's whole historical range as an explicit state machine advanced by
//! [`LocalHistoricalSync::step`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use omnisync_core::client::{BlockSelector, ChainClient, LogQuery};
use omnisync_core::error::SyncError;
use omnisync_core::estimate::{next_block_range, MIN_BLOCK_RANGE};
use omnisync_core::filter::{Fragment, Source};
use omnisync_core::interval::{self, Interval};
use omnisync_core::progress::SyncProgress;
use omnisync_core::store::{LogRecord, SyncBatch, SyncStore};
use omnisync_core::types::{Block, LightBlock, Log};

// ─── HistoricalSync ──────────────────────────────────────────────────────────

/// Window-level historical sync for one chain.
pub struct HistoricalSync {
    chain_id: u64,
    client: Arc<dyn ChainClient>,
    store: Arc<dyn SyncStore>,
    sources: Vec<Source>,
    /// Synced intervals per fragment id, mirrored from the store.
    intervals: HashMap<String, Vec<Interval>>,
}

impl HistoricalSync {
    /// Load the interval cache for every fragment of `sources`.
    pub async fn new(
        chain_id: u64,
        client: Arc<dyn ChainClient>,
        store: Arc<dyn SyncStore>,
        sources: Vec<Source>,
    ) -> Result<Self, SyncError> {
        let fragments: Vec<Fragment> = sources
            .iter()
            .flat_map(|s| s.filter.fragments())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let stored = store.get_intervals(chain_id, &fragments).await?;
        let intervals = fragments
            .into_iter()
            .map(|f| f.id)
            .zip(stored)
            .collect();

        Ok(Self {
            chain_id,
            client,
            store,
            sources,
            intervals,
        })
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Blocks of `source` already covered: the intersection of its fragments.
    fn coverage(&self, source: &Source) -> Vec<Interval> {
        let sets: Vec<Vec<Interval>> = source
            .filter
            .fragments()
            .iter()
            .map(|f| self.intervals.get(&f.id).cloned().unwrap_or_default())
            .collect();
        interval::intersection_many(&sets)
    }

    /// Part of `window` that `source` still needs.
    fn required(&self, source: &Source, window: Interval) -> Vec<Interval> {
        let clipped = interval::intersection(&[window], &[source.filter.block_range()]);
        interval::difference(&clipped, &self.coverage(source))
    }

    /// Blocks still to sync up to `last`, over every source, and the total.
    pub fn required_blocks(&self, last: u64) -> (u64, u64) {
        let mut required = Vec::new();
        let mut total = Vec::new();
        for source in &self.sources {
            let (from, _) = source.filter.block_range();
            if from > last {
                continue;
            }
            required.extend(self.required(source, (from, last)));
            total.extend(interval::intersection(&[(from, last)], &[source.filter.block_range()]));
        }
        (
            interval::sum(&interval::union(&required)),
            interval::sum(&interval::union(&total)),
        )
    }

    /// Highest block an earlier run fully synced for every source.
    ///
    /// A source counts as complete up to the end of its first cached interval
    /// when that interval starts at the source's first block.
    pub fn cached_block_number(&self) -> Option<u64> {
        let completed: Vec<Option<u64>> = self
            .sources
            .iter()
            .map(|source| {
                let range = source.filter.block_range();
                let done = interval::intersection(&[range], &self.coverage(source));
                match done.first() {
                    Some(&(start, end)) if start == range.0 => Some(end),
                    _ => None,
                }
            })
            .collect();

        let min = completed.iter().flatten().min().copied()?;
        let every = completed
            .iter()
            .zip(&self.sources)
            .all(|(done, source)| done.is_some() || source.filter.block_range().0 > min);
        every.then_some(min)
    }

    /// Sync `window` for every source.
    ///
    /// Returns the block at the end of the window, or `None` if every source
    /// already had the window cached and nothing was fetched.
    pub async fn sync(&mut self, window: Interval) -> Result<Option<LightBlock>, SyncError> {
        let plan: Vec<(usize, Vec<Interval>)> = self
            .sources
            .iter()
            .enumerate()
            .map(|(i, source)| (i, self.required(source, window)))
            .filter(|(_, required)| !required.is_empty())
            .collect();
        if plan.is_empty() {
            debug!(chain_id = self.chain_id, from = window.0, to = window.1, "window cached");
            return Ok(None);
        }

        let mut logs: BTreeMap<String, LogRecord> = BTreeMap::new();
        let mut matched: Vec<(usize, Log)> = Vec::new();
        for (i, required) in &plan {
            let source = &self.sources[*i];
            for &(from, to) in required {
                match source.filter.factory_ref() {
                    Some(factory) => {
                        let creations = self
                            .client
                            .get_logs(&LogQuery::for_factory(factory, from, to))
                            .await?;
                        let mut children: HashMap<String, u64> = HashMap::new();
                        if from > 0 {
                            for child in self
                                .store
                                .get_child_addresses(self.chain_id, factory, from - 1)
                                .await?
                            {
                                children.insert(child, 0);
                            }
                        }
                        for log in &creations {
                            if let Some(child) = factory.child_address(log) {
                                let first = children.entry(child).or_insert(log.block_number);
                                *first = (*first).min(log.block_number);
                            }
                            logs.entry(log.id())
                                .or_insert_with(|| LogRecord::factory(log.clone()));
                        }

                        let candidates = self
                            .client
                            .get_logs(&LogQuery::for_filter(&source.filter, from, to))
                            .await?;
                        matched.extend(
                            candidates
                                .into_iter()
                                .filter(|log| {
                                    source.filter.matches(log, |_, address| {
                                        children
                                            .get(address)
                                            .is_some_and(|first| *first <= log.block_number)
                                    })
                                })
                                .map(|log| (*i, log)),
                        );
                    }
                    None => {
                        let fetched = self
                            .client
                            .get_logs(&LogQuery::for_filter(&source.filter, from, to))
                            .await?;
                        matched.extend(
                            fetched
                                .into_iter()
                                .filter(|log| source.filter.matches_candidate(log))
                                .map(|log| (*i, log)),
                        );
                    }
                }
            }
        }

        let block_numbers: BTreeSet<u64> = matched.iter().map(|(_, l)| l.block_number).collect();
        let mut blocks: BTreeMap<u64, Block> = BTreeMap::new();
        for number in block_numbers.iter().copied().chain(std::iter::once(window.1)) {
            if blocks.contains_key(&number) {
                continue;
            }
            let block = self
                .client
                .get_block(BlockSelector::Number(number))
                .await?
                .ok_or_else(|| SyncError::Rpc(format!("block {number} not found on chain {}", self.chain_id)))?;
            blocks.insert(number, block);
        }

        let mut batch = SyncBatch::new(self.chain_id);
        let mut transactions = BTreeMap::new();
        let mut receipt_hashes = BTreeSet::new();
        let mut trace_hashes: BTreeMap<u64, HashSet<String>> = BTreeMap::new();
        for (i, log) in matched {
            let filter = &self.sources[i].filter;
            let Some(block) = blocks.get(&log.block_number) else {
                continue;
            };
            let checkpoint = log.checkpoint(&block.light(), self.chain_id)?.encode();
            let transaction = block.transaction(&log.transaction_hash).ok_or_else(|| {
                SyncError::malformed(
                    self.chain_id,
                    format!("transaction {} of log {} is missing", log.transaction_hash, log.id()),
                )
            })?;
            transactions.insert(transaction.hash.clone(), transaction.clone());
            if filter.include_transaction_receipts {
                receipt_hashes.insert(transaction.hash.clone());
            }
            if filter.include_call_traces {
                trace_hashes
                    .entry(block.number)
                    .or_default()
                    .insert(transaction.hash.clone());
            }
            logs.insert(log.id(), LogRecord::event(log, checkpoint));
        }

        for hash in receipt_hashes {
            let receipt = self
                .client
                .get_transaction_receipt(&hash)
                .await?
                .ok_or_else(|| SyncError::malformed(self.chain_id, format!("receipt {hash} is missing")))?;
            batch.transaction_receipts.push(receipt);
        }
        for (number, hashes) in trace_hashes {
            let traces = self.client.get_block_traces(number).await?;
            batch
                .traces
                .extend(traces.into_iter().filter(|t| hashes.contains(&t.transaction_hash)));
        }

        let end = blocks
            .get(&window.1)
            .map(Block::light)
            .ok_or_else(|| SyncError::Rpc(format!("block {} not found", window.1)))?;
        for number in block_numbers {
            if let Some(block) = blocks.remove(&number) {
                batch.blocks.push(block);
            }
        }
        batch.logs = logs.into_values().collect();
        batch.transactions = transactions.into_values().collect();

        for source in &self.sources {
            let synced = interval::intersection(&[window], &[source.filter.block_range()]);
            for fragment in source.filter.fragments() {
                for range in &synced {
                    batch.intervals.push((fragment.clone(), *range));
                }
            }
        }
        let new_intervals = batch.intervals.clone();

        debug!(
            chain_id = self.chain_id,
            from = window.0,
            to = window.1,
            logs = batch.logs.len(),
            blocks = batch.blocks.len(),
            "window synced"
        );
        self.store.insert_batch(batch).await?;

        for (fragment, range) in new_intervals {
            let stored = self.intervals.entry(fragment.id).or_default();
            stored.push(range);
            *stored = interval::union(stored);
        }

        Ok(Some(end))
    }
}

// ─── LocalHistoricalSync ─────────────────────────────────────────────────────

/// What one [`LocalHistoricalSync::step`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoricalStep {
    /// `current` moved forward to this block.
    Progress(LightBlock),
    /// Nothing left to sync; carries the final `current`.
    Done(Option<LightBlock>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverState {
    Start,
    Window { from: u64 },
    Done,
}

/// Backfill driver for one chain.
pub struct LocalHistoricalSync {
    chain_id: u64,
    sync: HistoricalSync,
    progress: SyncProgress,
    estimate: u64,
    state: DriverState,
}

impl LocalHistoricalSync {
    pub fn new(chain_id: u64, sync: HistoricalSync, progress: SyncProgress) -> Self {
        Self {
            chain_id,
            sync,
            progress,
            estimate: MIN_BLOCK_RANGE,
            state: DriverState::Start,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn progress(&self) -> &SyncProgress {
        &self.progress
    }

    /// Raise the finalized block (after a staleness refetch) and resume.
    pub fn set_finalized(&mut self, finalized: LightBlock) {
        if finalized.number <= self.progress.finalized.number {
            return;
        }
        self.progress.finalized = finalized;
        if self.state == DriverState::Done {
            let from = self
                .progress
                .current
                .as_ref()
                .map_or(self.progress.start.number, |c| c.number + 1);
            self.state = DriverState::Window { from };
        }
    }

    /// Advance the backfill by at most one synced window.
    pub async fn step(&mut self) -> Result<HistoricalStep, SyncError> {
        loop {
            match self.state {
                DriverState::Done => return Ok(HistoricalStep::Done(self.progress.current.clone())),
                DriverState::Start => {
                    if let Some(step) = self.start() {
                        return Ok(step);
                    }
                }
                DriverState::Window { from } => {
                    if self.progress.is_end() || self.progress.is_finalized() {
                        self.state = DriverState::Done;
                        continue;
                    }
                    let last = self.progress.historical_last().clone();
                    let window = (
                        from.min(last.number),
                        from.saturating_add(self.estimate).min(last.number),
                    );

                    let started = Instant::now();
                    let synced = self.sync.sync(window).await?;
                    self.state = DriverState::Window {
                        from: window.1.saturating_add(1),
                    };

                    match synced {
                        Some(block) => {
                            let duration_ms = started.elapsed().as_millis() as u64;
                            self.estimate =
                                next_block_range(window.1 - window.0, duration_ms, self.estimate);
                            let current = if window.1 == last.number { last } else { block };
                            self.progress.current = Some(current.clone());
                            return Ok(HistoricalStep::Progress(current));
                        }
                        None if window.1 == last.number => {
                            self.progress.current = Some(last.clone());
                            return Ok(HistoricalStep::Progress(last));
                        }
                        None => continue,
                    }
                }
            }
        }
    }

    /// First step: skip unfinalized starts and fast-forward over cached ranges.
    fn start(&mut self) -> Option<HistoricalStep> {
        let chain_id = self.chain_id;
        if self.progress.start_is_unfinalized() {
            warn!(
                chain_id,
                start = self.progress.start.number,
                finalized = self.progress.finalized.number,
                "start block is not finalized, skipping historical sync"
            );
            self.progress.current = Some(self.progress.finalized.clone());
            self.state = DriverState::Done;
            return None;
        }

        let last = self.progress.historical_last().clone();
        let (required, total) = self.sync.required_blocks(last.number);
        let cached_pct = if total == 0 {
            100.0
        } else {
            100.0 * (total - required) as f64 / total as f64
        };
        info!(
            chain_id,
            start = self.progress.start.number,
            last = last.number,
            cached = format!("{cached_pct:.1}%"),
            "starting historical sync"
        );

        let current = self.progress.current.clone();
        let cached = self.progress.cached.clone();
        match (current, cached) {
            (Some(current), None) => {
                self.state = DriverState::Window {
                    from: current.number + 1,
                };
                None
            }
            (Some(current), Some(cached)) if current.number > cached.number => {
                self.state = DriverState::Window {
                    from: current.number + 1,
                };
                None
            }
            (_, Some(cached)) => {
                self.progress.current = Some(cached.clone());
                self.state = if cached.number >= last.number {
                    DriverState::Done
                } else {
                    DriverState::Window {
                        from: cached.number + 1,
                    }
                };
                Some(HistoricalStep::Progress(cached))
            }
            (None, None) => {
                self.state = DriverState::Window {
                    from: self.progress.start.number,
                };
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_chain::{EmittedLog, InMemoryChain};
    use omnisync_core::checkpoint::Checkpoint;
    use omnisync_core::filter::{ChildAddressLocation, Factory, LogFilter};
    use omnisync_core::store::EventQuery;
    use omnisync_storage::InMemoryStore;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const TRANSFER: &str = "0xddf252ad";

    fn chain_with_transfers(blocks: u64) -> Arc<InMemoryChain> {
        let chain = Arc::new(InMemoryChain::new(1));
        for _ in 0..blocks {
            chain.mine(vec![EmittedLog::new(TOKEN).topic(TRANSFER)]);
        }
        chain
    }

    fn token_source() -> Source {
        Source::new("token", LogFilter::address(1, TOKEN).topic0(TRANSFER))
    }

    fn progress(chain: &InMemoryChain, start: u64, finalized: u64) -> SyncProgress {
        SyncProgress {
            start: chain.block(start).unwrap(),
            end: None,
            finalized: chain.block(finalized).unwrap(),
            cached: None,
            current: None,
        }
    }

    async fn events(store: &InMemoryStore, sources: Vec<Source>) -> usize {
        store
            .get_events(&EventQuery {
                sources,
                from: Checkpoint::ZERO.encode(),
                to: Checkpoint::MAX.encode(),
                limit: usize::MAX,
            })
            .await
            .unwrap()
            .events
            .len()
    }

    #[tokio::test]
    async fn sync_fetches_and_records_interval() {
        let chain = chain_with_transfers(10);
        let store = Arc::new(InMemoryStore::new());
        let mut sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![token_source()])
            .await
            .unwrap();

        let end = sync.sync((1, 5)).await.unwrap().unwrap();
        assert_eq!(end.number, 5);
        assert_eq!(events(&store, vec![token_source()]).await, 5);

        let calls = chain.log_calls();
        assert!(sync.sync((2, 4)).await.unwrap().is_none());
        assert_eq!(chain.log_calls(), calls);

        let fragments = token_source().filter.fragments();
        let stored = store.get_intervals(1, &fragments).await.unwrap();
        assert_eq!(stored, vec![vec![(1, 5)]]);
    }

    #[tokio::test]
    async fn sync_only_fetches_missing_part() {
        let chain = chain_with_transfers(10);
        let store = Arc::new(InMemoryStore::new());
        let mut sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![token_source()])
            .await
            .unwrap();
        sync.sync((1, 5)).await.unwrap();
        sync.sync((3, 8)).await.unwrap();
        assert_eq!(events(&store, vec![token_source()]).await, 8);
    }

    #[tokio::test]
    async fn factory_children_are_followed() {
        let chain = Arc::new(InMemoryChain::new(1));
        let child = format!("0x{}", "cd".repeat(20));
        let factory = Factory {
            address: "0x00000000000000000000000000000000000000fa".into(),
            event_selector: "0x0d3648bd".into(),
            child_address_location: ChildAddressLocation::Topic(1),
        };
        chain.mine(vec![EmittedLog::new(&child).topic(TRANSFER)]);
        chain.mine(vec![EmittedLog::new(&factory.address)
            .topic(&factory.event_selector)
            .topic(format!("0x{}{}", "0".repeat(24), "cd".repeat(20)))]);
        chain.mine(vec![EmittedLog::new(&child).topic(TRANSFER)]);
        chain.mine(vec![EmittedLog::new(TOKEN).topic(TRANSFER)]);

        let source = Source::new("pairs", LogFilter::factory(1, factory.clone()).topic0(TRANSFER));
        let store = Arc::new(InMemoryStore::new());
        let mut sync = HistoricalSync::new(1, chain, store.clone(), vec![source.clone()])
            .await
            .unwrap();
        sync.sync((0, 4)).await.unwrap();

        // Only the transfer after the creation block counts.
        assert_eq!(events(&store, vec![source]).await, 1);
        assert_eq!(store.get_child_addresses(1, &factory, 4).await.unwrap(), vec![child]);
    }

    #[tokio::test]
    async fn receipts_and_traces_are_opt_in() {
        let chain = chain_with_transfers(3);
        let store = Arc::new(InMemoryStore::new());
        let source = Source::new("token", LogFilter::address(1, TOKEN).with_receipts().with_traces());
        let mut sync = HistoricalSync::new(1, chain, store.clone(), vec![source]).await.unwrap();
        sync.sync((0, 3)).await.unwrap();
        assert_eq!(store.receipt_count(1), 3);
    }

    #[tokio::test]
    async fn cached_block_requires_every_source() {
        let chain = chain_with_transfers(20);
        let store = Arc::new(InMemoryStore::new());
        let a = Source::new("a", LogFilter::address(1, TOKEN).from_block(0));
        let b = Source::new("b", LogFilter::address(1, "0xbb").from_block(12));

        let mut sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![a.clone()])
            .await
            .unwrap();
        sync.sync((0, 10)).await.unwrap();
        assert_eq!(sync.cached_block_number(), Some(10));

        // b starts after 10, so a's progress alone is enough.
        let sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![a.clone(), b.clone()])
            .await
            .unwrap();
        assert_eq!(sync.cached_block_number(), Some(10));

        let c = Source::new("c", LogFilter::address(1, "0xcc").from_block(5));
        let sync = HistoricalSync::new(1, chain, store, vec![a, c]).await.unwrap();
        assert_eq!(sync.cached_block_number(), None);
    }

    #[tokio::test]
    async fn driver_runs_to_finalized() {
        let chain = chain_with_transfers(100);
        let store = Arc::new(InMemoryStore::new());
        let sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![token_source()])
            .await
            .unwrap();
        let mut driver = LocalHistoricalSync::new(1, sync, progress(&chain, 1, 90));

        let mut last = 0;
        loop {
            match driver.step().await.unwrap() {
                HistoricalStep::Progress(block) => {
                    assert!(block.number > last || last == 0);
                    last = block.number;
                }
                HistoricalStep::Done(current) => {
                    assert_eq!(current.unwrap().number, 90);
                    break;
                }
            }
        }
        assert_eq!(last, 90);
        assert_eq!(events(&store, vec![token_source()]).await, 90);
    }

    #[tokio::test]
    async fn driver_fast_forwards_over_cache() {
        let chain = chain_with_transfers(50);
        let store = Arc::new(InMemoryStore::new());
        let mut sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![token_source()])
            .await
            .unwrap();
        sync.sync((0, 50)).await.unwrap();

        let sync = HistoricalSync::new(1, chain.clone(), store, vec![token_source()])
            .await
            .unwrap();
        let mut p = progress(&chain, 1, 40);
        p.cached = chain.block(sync.cached_block_number().unwrap().min(40));
        let mut driver = LocalHistoricalSync::new(1, sync, p);
        let calls = chain.log_calls();

        assert_eq!(driver.step().await.unwrap(), HistoricalStep::Progress(chain.block(40).unwrap()));
        assert!(matches!(driver.step().await.unwrap(), HistoricalStep::Done(Some(b)) if b.number == 40));
        assert_eq!(chain.log_calls(), calls);
    }

    #[tokio::test]
    async fn driver_resumes_after_current_without_cache() {
        let chain = chain_with_transfers(30);
        let store = Arc::new(InMemoryStore::new());
        let sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![token_source()])
            .await
            .unwrap();
        let mut p = progress(&chain, 1, 20);
        p.current = chain.block(10);
        let mut driver = LocalHistoricalSync::new(1, sync, p);
        while let HistoricalStep::Progress(block) = driver.step().await.unwrap() {
            assert!(block.number > 10);
        }
        assert_eq!(driver.progress().current.as_ref().unwrap().number, 20);
        assert_eq!(events(&store, vec![token_source()]).await, 10);
    }

    #[tokio::test]
    async fn driver_skips_unfinalized_start() {
        let chain = chain_with_transfers(10);
        let store = Arc::new(InMemoryStore::new());
        let sync = HistoricalSync::new(1, chain.clone(), store, vec![token_source()])
            .await
            .unwrap();
        let mut driver = LocalHistoricalSync::new(1, sync, progress(&chain, 8, 5));
        let step = driver.step().await.unwrap();
        assert_eq!(step, HistoricalStep::Done(chain.block(5)));
        assert_eq!(chain.log_calls(), 0);
    }

    #[tokio::test]
    async fn driver_resumes_after_finalized_moves() {
        let chain = chain_with_transfers(30);
        let store = Arc::new(InMemoryStore::new());
        let sync = HistoricalSync::new(1, chain.clone(), store.clone(), vec![token_source()])
            .await
            .unwrap();
        let mut driver = LocalHistoricalSync::new(1, sync, progress(&chain, 1, 10));
        while let HistoricalStep::Progress(_) = driver.step().await.unwrap() {}

        driver.set_finalized(chain.block(25).unwrap());
        while let HistoricalStep::Progress(_) = driver.step().await.unwrap() {}
        assert_eq!(driver.progress().current.as_ref().unwrap().number, 25);
        assert_eq!(events(&store, vec![token_source()]).await, 25);
    }
}
