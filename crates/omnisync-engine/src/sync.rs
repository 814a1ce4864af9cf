//! The multi-chain sync coordinator.
//!
//! # Phases
//!
//! 1. **Historical**: [`Sync::historical_events`] runs every chain's backfill
//!    driver on its own task and pages the store's ordered event stream up to
//!    the minimum safe checkpoint across chains.
//! 2. **Realtime**: [`Sync::start_realtime`] hands every chain to a tip poller
//!    and a consumer task. Consumers feed the omnichain state and deliver
//!    [`RealtimeEvent`]s to the [`SyncConsumer`], one at a time across chains.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use omnisync_core::checkpoint::Checkpoint;
use omnisync_core::client::{BlockSelector, ChainClient};
use omnisync_core::config::{NetworkConfig, SyncConfig};
use omnisync_core::error::SyncError;
use omnisync_core::estimate::{estimate, EstimateParams};
use omnisync_core::filter::Source;
use omnisync_core::progress::{ProgressTag, SyncProgress};
use omnisync_core::store::{EventQuery, SyncStore};
use omnisync_core::types::RawEvent;

use crate::cached::CachedClient;
use crate::consumer::{EventBatch, RealtimeEvent, Status, SyncConsumer};
use crate::diagnostic::{self, fetch_block};
use crate::factory::ChildAddresses;
use crate::historical::{HistoricalStep, HistoricalSync, LocalHistoricalSync};
use crate::omnichain::{ChainState, OmnichainState};
use crate::queue::RequestQueue;
use crate::realtime::{RealtimeSync, RealtimeSyncEvent};

/// Capacity of each chain's realtime event queue.
const REALTIME_QUEUE_CAPACITY: usize = 128;

const ESTIMATE_SECONDS_INITIAL: u64 = 1_000;
const ESTIMATE_SECONDS_MIN: u64 = 10;
const ESTIMATE_SECONDS_MAX: u64 = 86_400;
const ESTIMATE_MAX_INCREASE: f64 = 1.08;

/// One chain's fixed wiring.
struct ChainRuntime {
    network: NetworkConfig,
    sources: Vec<Source>,
    /// Rate-limited, RPC-cached client.
    client: Arc<dyn ChainClient>,
}

struct Shared {
    config: SyncConfig,
    store: Arc<dyn SyncStore>,
    consumer: Arc<dyn SyncConsumer>,
    chains: BTreeMap<u64, ChainRuntime>,
    state: Mutex<OmnichainState>,
    /// Held while a realtime event is applied and delivered, so deliveries
    /// from different chains never interleave.
    delivery: tokio::sync::Mutex<()>,
    kill: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    drivers: Mutex<Option<BTreeMap<u64, LocalHistoricalSync>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, OmnichainState> {
        lock(&self.state)
    }

    fn is_killed(&self) -> bool {
        *self.kill.borrow()
    }

    /// Apply one realtime event and deliver what it produced.
    /// Returns `false` once the chain's realtime sync is complete.
    async fn handle_realtime(
        &self,
        chain_id: u64,
        event: RealtimeSyncEvent,
    ) -> Result<bool, SyncError> {
        let _delivery = self.delivery.lock().await;
        if self.is_killed() {
            return Ok(false);
        }

        match event {
            RealtimeSyncEvent::Block(block) => {
                let delivered = self.state().apply_block(chain_id, *block)?;
                if let Some(event) = delivered {
                    self.consumer.on_realtime_event(event).await?;
                }
                Ok(true)
            }
            RealtimeSyncEvent::Finalize(block) => {
                let number = block.number;
                let outcome = self.state().apply_finalize(chain_id, block)?;
                if !outcome.batch.is_empty() {
                    self.store.insert_batch(outcome.batch).await?;
                }
                if let Some(event) = outcome.event {
                    self.consumer.on_realtime_event(event).await?;
                }
                if outcome.reached_end {
                    info!(chain_id, finalized = number, "synced final end block, stopping realtime sync");
                    return Ok(false);
                }
                Ok(true)
            }
            RealtimeSyncEvent::Reorg {
                ancestor,
                reorged_blocks,
            } => {
                let outcome = self
                    .state()
                    .apply_reorg(chain_id, ancestor, &reorged_blocks)?;
                self.store
                    .prune_rpc_request_result(chain_id, &outcome.reorged_block_numbers)
                    .await?;
                self.consumer.on_realtime_event(outcome.event).await?;
                Ok(true)
            }
        }
    }
}

/// Per-chain consumer: serializes the chain's realtime events.
async fn consume_realtime(
    shared: Arc<Shared>,
    chain_id: u64,
    mut events: mpsc::Receiver<Result<RealtimeSyncEvent, SyncError>>,
    stop: watch::Sender<bool>,
) {
    let mut kill = shared.kill.subscribe();
    loop {
        let message = tokio::select! {
            _ = kill.changed() => break,
            message = events.recv() => message,
        };
        let Some(message) = message else { break };
        if shared.is_killed() {
            break;
        }

        let result = match message {
            Ok(event) => shared.handle_realtime(chain_id, event).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                error!(chain_id, error = %e, "realtime sync failed");
                if !shared.is_killed() {
                    shared.consumer.on_fatal_error(e).await;
                }
                break;
            }
        }
    }
    stop.send_replace(true);
    debug!(chain_id, "realtime consumer stopped");
}

/// A configured multi-chain sync.
pub struct Sync {
    shared: Arc<Shared>,
}

impl Sync {
    /// Probe every chain, recover cached progress and prepare the backfill
    /// drivers. Clients are wrapped in a [`RequestQueue`] and a
    /// [`CachedClient`].
    pub async fn new(
        config: SyncConfig,
        clients: BTreeMap<u64, Arc<dyn ChainClient>>,
        store: Arc<dyn SyncStore>,
        consumer: Arc<dyn SyncConsumer>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        if let Some(initial) = &config.options.initial_checkpoint {
            Checkpoint::decode(initial)?;
        }

        let mut chains = BTreeMap::new();
        let mut states = Vec::new();
        let mut drivers = BTreeMap::new();
        for network in &config.networks {
            let chain_id = network.chain_id;
            let raw = clients.get(&chain_id).cloned().ok_or_else(|| {
                SyncError::Config(format!("no client for network {:?} ({chain_id})", network.name))
            })?;
            let queue: Arc<dyn ChainClient> = Arc::new(RequestQueue::new(raw, network));
            let client: Arc<dyn ChainClient> =
                Arc::new(CachedClient::new(chain_id, queue, store.clone()));
            let sources: Vec<Source> = config.sources_for(chain_id).cloned().collect();

            let diag = diagnostic::sync_diagnostic(network, &sources, client.as_ref()).await?;
            if network.disable_cache {
                info!(chain_id, from = diag.start.number, "cache disabled, pruning stored data");
                store.prune_by_chain(chain_id, diag.start.number).await?;
            }

            let historical =
                HistoricalSync::new(chain_id, client.clone(), store.clone(), sources.clone()).await?;
            let mut progress = SyncProgress {
                start: diag.start,
                end: diag.end,
                finalized: diag.finalized,
                cached: None,
                current: None,
            };
            if let Some(cached) = historical.cached_block_number() {
                let number = cached.min(progress.historical_last().number);
                progress.cached = Some(
                    fetch_block(client.as_ref(), chain_id, BlockSelector::Number(number))
                        .await?,
                );
            }
            info!(
                chain_id,
                network = %network.name,
                start = progress.start.number,
                finalized = progress.finalized.number,
                cached = ?progress.cached.as_ref().map(|b| b.number),
                "chain ready"
            );

            drivers.insert(
                chain_id,
                LocalHistoricalSync::new(chain_id, historical, progress.clone()),
            );
            states.push(ChainState::new(network.clone(), sources.clone(), progress));
            chains.insert(
                chain_id,
                ChainRuntime {
                    network: network.clone(),
                    sources,
                    client,
                },
            );
        }

        let (kill, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                store,
                consumer,
                chains,
                state: Mutex::new(OmnichainState::new(states)),
                delivery: tokio::sync::Mutex::new(()),
                kill,
                tasks: Mutex::new(Vec::new()),
                drivers: Mutex::new(Some(drivers)),
            }),
        })
    }

    /// The ordered historical event stream. Can be taken once.
    pub fn historical_events(&self) -> Result<HistoricalEvents, SyncError> {
        let drivers = lock(&self.shared.drivers)
            .take()
            .ok_or_else(|| SyncError::Other("historical events were already taken".into()))?;

        let from = match &self.shared.config.options.initial_checkpoint {
            Some(initial) if *initial != Checkpoint::ZERO.encode() => initial.clone(),
            _ => self.start_checkpoint()?,
        };
        Ok(HistoricalEvents {
            shared: self.shared.clone(),
            drivers,
            round: None,
            round_finished: false,
            finalized_fetched_at: Instant::now(),
            from,
            estimate_seconds: ESTIMATE_SECONDS_INITIAL,
            done: false,
        })
    }

    /// Switch every chain to realtime. Call once the historical stream is
    /// exhausted.
    pub async fn start_realtime(&self) -> Result<(), SyncError> {
        let shared = &self.shared;
        for (chain_id, runtime) in &shared.chains {
            let chain_id = *chain_id;
            let (from, to, at_end, finalized) = {
                let state = shared.state();
                let chain = &state.chains[&chain_id];
                let from = state.omnichain_checkpoint(ProgressTag::Finalized);
                let to = [
                    chain.checkpoint(ProgressTag::Finalized),
                    chain.checkpoint(ProgressTag::End),
                ]
                .into_iter()
                .flatten()
                .min();
                (
                    from,
                    to,
                    chain.progress.is_end() || chain.reached_end(),
                    chain.progress.finalized.clone(),
                )
            };

            // Events this chain synced historically but that must be ordered
            // against realtime events of the other chains.
            let mut pending: Vec<RawEvent> = Vec::new();
            if let (Some(from), Some(to)) = (from, to) {
                let mut cursor = from;
                while cursor < to {
                    let page = shared
                        .store
                        .get_events(&EventQuery {
                            sources: runtime.sources.clone(),
                            from: cursor,
                            to: to.clone(),
                            limit: shared.config.options.events_query_size,
                        })
                        .await?;
                    pending.extend(page.events);
                    cursor = page.cursor;
                }
            }

            if at_end {
                shared
                    .state()
                    .start_realtime(chain_id, pending, ChildAddresses::new())?;
                info!(chain_id, network = %runtime.network.name, "sync complete, realtime not needed");
                continue;
            }

            let factories: Vec<_> = runtime
                .sources
                .iter()
                .filter_map(|s| s.filter.factory_ref().cloned())
                .collect();
            let children =
                ChildAddresses::resolve(shared.store.as_ref(), chain_id, &factories, finalized.number)
                    .await?;
            let queued = pending.len();
            shared.state().start_realtime(chain_id, pending, children)?;

            let poller = RealtimeSync::new(
                runtime.network.clone(),
                runtime.client.clone(),
                runtime.sources.clone(),
                finalized,
            );
            let (sender, receiver) = mpsc::channel(REALTIME_QUEUE_CAPACITY);
            let (stop, stop_rx) = watch::channel(false);
            let poll_task = tokio::spawn(poller.run(sender, stop_rx));
            let consume_task =
                tokio::spawn(consume_realtime(shared.clone(), chain_id, receiver, stop));
            lock(&shared.tasks).extend([poll_task, consume_task]);
            info!(chain_id, network = %runtime.network.name, pending = queued, "realtime sync started");
        }
        Ok(())
    }

    /// Status of every network, keyed by name.
    pub fn status(&self) -> Status {
        self.shared.state().status.clone()
    }

    pub fn start_checkpoint(&self) -> Result<String, SyncError> {
        self.shared
            .state()
            .omnichain_checkpoint(ProgressTag::Start)
            .ok_or_else(|| SyncError::Other("no chains configured".into()))
    }

    pub fn finalized_checkpoint(&self) -> Result<String, SyncError> {
        self.shared
            .state()
            .omnichain_checkpoint(ProgressTag::Finalized)
            .ok_or_else(|| SyncError::Other("no chains configured".into()))
    }

    /// A chain's progress as currently known.
    pub fn progress(&self, chain_id: u64) -> Option<SyncProgress> {
        self.shared
            .state()
            .chains
            .get(&chain_id)
            .map(|c| c.progress.clone())
    }

    /// The rate-limited, block-cached client for a chain.
    pub fn client(&self, chain_id: u64) -> Option<Arc<dyn ChainClient>> {
        self.shared.chains.get(&chain_id).map(|c| c.client.clone())
    }

    /// Stop everything and wait for the realtime tasks. Queued realtime
    /// events are dropped and nothing is delivered afterwards.
    pub async fn kill(&self) {
        self.shared.kill.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *lock(&self.shared.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "sync task panicked");
            }
        }
        info!("sync killed");
    }
}

// ─── Historical event stream ─────────────────────────────────────────────────

/// Progress report from a backfill task.
struct Tick {
    chain_id: u64,
    step: HistoricalStep,
}

/// One round of backfill: every driver on its own task.
struct Round {
    ticks: mpsc::Receiver<Result<Tick, SyncError>>,
    handles: Vec<JoinHandle<Option<LocalHistoricalSync>>>,
}

/// Step a driver until it is done. Errors travel through `ticks`; the driver
/// comes back unless it failed or the sync was killed.
async fn drive(
    mut driver: LocalHistoricalSync,
    ticks: mpsc::Sender<Result<Tick, SyncError>>,
    mut kill: watch::Receiver<bool>,
) -> Option<LocalHistoricalSync> {
    let chain_id = driver.chain_id();
    loop {
        if *kill.borrow() {
            return None;
        }
        let step = tokio::select! {
            _ = kill.changed() => return None,
            step = driver.step() => step,
        };
        match step {
            Ok(step) => {
                let done = matches!(step, HistoricalStep::Done(_));
                if ticks.send(Ok(Tick { chain_id, step })).await.is_err() {
                    return None;
                }
                if done {
                    return Some(driver);
                }
            }
            Err(e) => {
                error!(chain_id, error = %e, "historical sync failed");
                let _ = ticks.send(Err(e)).await;
                return None;
            }
        }
    }
}

/// Ordered historical events across every chain.
pub struct HistoricalEvents {
    shared: Arc<Shared>,
    /// Drivers not currently running.
    drivers: BTreeMap<u64, LocalHistoricalSync>,
    round: Option<Round>,
    /// Set when a round ended and the staleness check is still due.
    round_finished: bool,
    finalized_fetched_at: Instant,
    /// Exclusive lower bound of the next page.
    from: String,
    estimate_seconds: u64,
    done: bool,
}

impl HistoricalEvents {
    /// The next non-empty batch of events, or `None` once every chain has
    /// synced its finalized range (or the sync was killed).
    pub async fn next_batch(&mut self) -> Result<Option<EventBatch>, SyncError> {
        loop {
            if self.done || self.shared.is_killed() {
                return Ok(None);
            }

            if let Some(batch) = self.page().await? {
                return Ok(Some(batch));
            }

            let Some(round) = self.round.as_mut() else {
                if std::mem::take(&mut self.round_finished)
                    && !self.refresh_stale_finalized().await?
                {
                    self.done = true;
                    info!("historical sync complete");
                    return Ok(None);
                }
                self.start_round();
                continue;
            };
            match round.ticks.recv().await {
                Some(Ok(tick)) => self.apply_tick(tick),
                Some(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                None => {
                    let handles = self.round.take().map(|r| r.handles).unwrap_or_default();
                    for handle in handles {
                        match handle.await {
                            Ok(Some(driver)) => {
                                self.drivers.insert(driver.chain_id(), driver);
                            }
                            Ok(None) => return Ok(None),
                            Err(e) => {
                                self.done = true;
                                return Err(SyncError::Other(format!("historical task failed: {e}")));
                            }
                        }
                    }
                    self.round_finished = true;
                }
            }
        }
    }

    /// Stream form of [`HistoricalEvents::next_batch`]. Ends after the first
    /// error.
    pub fn into_stream(self) -> impl Stream<Item = Result<EventBatch, SyncError>> {
        futures::stream::unfold(self, |mut events| async move {
            match events.next_batch().await {
                Ok(Some(batch)) => Some((Ok(batch), events)),
                Ok(None) => None,
                Err(e) => {
                    events.done = true;
                    Some((Err(e), events))
                }
            }
        })
    }

    /// The checkpoint delivery has reached.
    pub fn checkpoint(&self) -> &str {
        &self.from
    }

    fn start_round(&mut self) {
        let (sender, receiver) = mpsc::channel(self.drivers.len().max(1) * 2);
        let handles = std::mem::take(&mut self.drivers)
            .into_values()
            .map(|driver| tokio::spawn(drive(driver, sender.clone(), self.shared.kill.subscribe())))
            .collect();
        self.round = Some(Round {
            ticks: receiver,
            handles,
        });
    }

    fn apply_tick(&mut self, tick: Tick) {
        let current = match tick.step {
            HistoricalStep::Progress(block) => Some(block),
            HistoricalStep::Done(current) => current,
        };
        if let Some(current) = current {
            if let Some(chain) = self.shared.state().chains.get_mut(&tick.chain_id) {
                chain.progress.current = Some(current);
            }
        }
    }

    /// Upper bound for paging: `min(end, finalized, current)`, once every
    /// chain has a current block.
    fn target(&self) -> Option<String> {
        let state = self.shared.state();
        if state.chains.values().any(|c| c.progress.current.is_none()) {
            return None;
        }
        [ProgressTag::End, ProgressTag::Finalized, ProgressTag::Current]
            .into_iter()
            .filter_map(|tag| state.omnichain_checkpoint(tag))
            .min()
    }

    /// Page the store up to the current target, returning the first
    /// non-empty page.
    async fn page(&mut self) -> Result<Option<EventBatch>, SyncError> {
        let Some(to) = self.target() else {
            return Ok(None);
        };
        let options = &self.shared.config.options;
        let sources = self.shared.config.sources.clone();
        let mut failures = 0u32;

        while self.from < to {
            if self.shared.is_killed() {
                return Ok(None);
            }
            let from_ts = Checkpoint::decode(&self.from)?.block_timestamp;
            let estimated =
                Checkpoint::at_timestamp(from_ts.saturating_add(self.estimate_seconds)).encode();
            let bound = if estimated > self.from && estimated < to {
                estimated
            } else {
                to.clone()
            };

            let query = EventQuery {
                sources: sources.clone(),
                from: self.from.clone(),
                to: bound,
                limit: options.events_query_size,
            };
            match self.shared.store.get_events(&query).await {
                Ok(page) => {
                    failures = 0;
                    let cursor_ts = Checkpoint::decode(&page.cursor)?.block_timestamp;
                    debug!(
                        events = page.events.len(),
                        window_seconds = self.estimate_seconds,
                        from_timestamp = from_ts,
                        "fetched events"
                    );
                    self.shared
                        .state()
                        .update_historical_status(&page.events, &page.cursor);
                    self.estimate_seconds = estimate(
                        from_ts,
                        cursor_ts,
                        page.events.len() as u64,
                        self.estimate_seconds,
                        EstimateParams {
                            target: options.events_query_size as u64,
                            min: ESTIMATE_SECONDS_MIN,
                            max: ESTIMATE_SECONDS_MAX,
                            max_increase: ESTIMATE_MAX_INCREASE,
                        },
                    );
                    self.from = page.cursor.clone();
                    if !page.events.is_empty() {
                        return Ok(Some(EventBatch {
                            events: page.events,
                            checkpoint: page.cursor,
                        }));
                    }
                }
                Err(e) => {
                    let shrink = options.events_shrink_factor.max(1);
                    self.estimate_seconds = (self.estimate_seconds / shrink).max(ESTIMATE_SECONDS_MIN);
                    failures += 1;
                    warn!(
                        error = %e,
                        failures,
                        window_seconds = self.estimate_seconds,
                        "failed to fetch events, retrying with a smaller window"
                    );
                    if failures > options.events_retry_limit {
                        return Err(e);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Refetch finalized blocks if they are stale and some chain has not
    /// reached its end. Returns `true` if another round should run.
    async fn refresh_stale_finalized(&mut self) -> Result<bool, SyncError> {
        let stale_after = Duration::from_secs(self.shared.config.options.handoff_stale_seconds);
        if self.finalized_fetched_at.elapsed() <= stale_after {
            return Ok(false);
        }
        let all_ended = self
            .shared
            .state()
            .chains
            .values()
            .all(|c| c.progress.is_end());
        if all_ended {
            return Ok(false);
        }

        self.finalized_fetched_at = Instant::now();
        let mut advanced = false;
        for (chain_id, runtime) in &self.shared.chains {
            let finalized =
                diagnostic::finalized_block(&runtime.network, runtime.client.as_ref()).await?;
            debug!(chain_id, finalized = finalized.number, "refetched finalized block");
            if let Some(driver) = self.drivers.get_mut(chain_id) {
                driver.set_finalized(finalized.clone());
            }
            let mut state = self.shared.state();
            if let Some(chain) = state.chains.get_mut(chain_id) {
                if finalized.number > chain.progress.finalized.number {
                    chain.progress.finalized = finalized;
                    advanced = true;
                }
            }
        }
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::LogConsumer;
    use crate::memory_chain::{EmittedLog, InMemoryChain};
    use futures::StreamExt;
    use omnisync_core::filter::{Factory, Fragment, LogFilter};
    use omnisync_core::interval::Interval;
    use omnisync_core::store::{EventPage, LogRecord, SyncBatch};
    use omnisync_core::types::{Block, Trace, Transaction, TransactionReceipt};
    use omnisync_storage::InMemoryStore;

    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";

    async fn single_chain(chain: &Arc<InMemoryChain>, options: impl FnOnce(&mut SyncConfig)) -> Sync {
        single_chain_with_store(chain, Arc::new(InMemoryStore::new()), options).await
    }

    async fn single_chain_with_store(
        chain: &Arc<InMemoryChain>,
        store: Arc<dyn SyncStore>,
        options: impl FnOnce(&mut SyncConfig),
    ) -> Sync {
        let mut network = NetworkConfig::new("mainnet", 1).finality_block_count(5);
        network.max_requests_per_second = 10_000;
        let mut config = SyncConfig {
            networks: vec![network],
            sources: vec![Source::new("token", LogFilter::address(1, TOKEN))],
            ..SyncConfig::default()
        };
        options(&mut config);
        let client: Arc<dyn ChainClient> = chain.clone();
        Sync::new(
            config,
            BTreeMap::from([(1, client)]),
            store,
            Arc::new(LogConsumer),
        )
        .await
        .unwrap()
    }

    /// Fails the first `failures` event queries, then delegates.
    struct UnreliableEvents {
        inner: InMemoryStore,
        failures: std::sync::atomic::AtomicU32,
    }

    impl UnreliableEvents {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryStore::new(),
                failures: std::sync::atomic::AtomicU32::new(failures),
            }
        }
    }

    #[async_trait::async_trait]
    impl SyncStore for UnreliableEvents {
        async fn insert_blocks(&self, chain_id: u64, blocks: &[Block]) -> Result<(), SyncError> {
            self.inner.insert_blocks(chain_id, blocks).await
        }

        async fn insert_logs(&self, chain_id: u64, logs: &[LogRecord]) -> Result<(), SyncError> {
            self.inner.insert_logs(chain_id, logs).await
        }

        async fn insert_transactions(
            &self,
            chain_id: u64,
            transactions: &[Transaction],
        ) -> Result<(), SyncError> {
            self.inner.insert_transactions(chain_id, transactions).await
        }

        async fn insert_transaction_receipts(
            &self,
            chain_id: u64,
            receipts: &[TransactionReceipt],
        ) -> Result<(), SyncError> {
            self.inner.insert_transaction_receipts(chain_id, receipts).await
        }

        async fn insert_traces(&self, chain_id: u64, traces: &[Trace]) -> Result<(), SyncError> {
            self.inner.insert_traces(chain_id, traces).await
        }

        async fn insert_intervals(
            &self,
            chain_id: u64,
            intervals: &[(Fragment, Interval)],
        ) -> Result<(), SyncError> {
            self.inner.insert_intervals(chain_id, intervals).await
        }

        async fn insert_batch(&self, batch: SyncBatch) -> Result<(), SyncError> {
            self.inner.insert_batch(batch).await
        }

        async fn get_intervals(
            &self,
            chain_id: u64,
            fragments: &[Fragment],
        ) -> Result<Vec<Vec<Interval>>, SyncError> {
            self.inner.get_intervals(chain_id, fragments).await
        }

        async fn get_events(&self, query: &EventQuery) -> Result<EventPage, SyncError> {
            let failing = self.failures.fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            );
            if failing.is_ok() {
                return Err(SyncError::Storage("database is locked".into()));
            }
            self.inner.get_events(query).await
        }

        async fn get_child_addresses(
            &self,
            chain_id: u64,
            factory: &Factory,
            to_block: u64,
        ) -> Result<Vec<String>, SyncError> {
            self.inner.get_child_addresses(chain_id, factory, to_block).await
        }

        async fn insert_rpc_request_result(
            &self,
            chain_id: u64,
            block_number: u64,
            request: &str,
            result: &str,
        ) -> Result<(), SyncError> {
            self.inner
                .insert_rpc_request_result(chain_id, block_number, request, result)
                .await
        }

        async fn get_rpc_request_result(
            &self,
            chain_id: u64,
            request: &str,
        ) -> Result<Option<String>, SyncError> {
            self.inner.get_rpc_request_result(chain_id, request).await
        }

        async fn prune_rpc_request_result(
            &self,
            chain_id: u64,
            block_numbers: &[u64],
        ) -> Result<(), SyncError> {
            self.inner.prune_rpc_request_result(chain_id, block_numbers).await
        }

        async fn prune_by_chain(&self, chain_id: u64, from_block: u64) -> Result<(), SyncError> {
            self.inner.prune_by_chain(chain_id, from_block).await
        }
    }

    fn retry_options(config: &mut SyncConfig) {
        config.options.events_retry_limit = 2;
        config.options.events_shrink_factor = 2;
    }

    fn mine(chain: &InMemoryChain, blocks: u64) {
        for _ in 0..blocks {
            chain.mine(vec![EmittedLog::new(TOKEN)]);
        }
    }

    #[tokio::test]
    async fn historical_events_can_be_taken_once() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 3);
        let sync = single_chain(&chain, |_| {}).await;
        assert!(sync.historical_events().is_ok());
        assert!(matches!(sync.historical_events(), Err(SyncError::Other(_))));
    }

    #[tokio::test]
    async fn stream_pages_up_to_finalized() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 30);
        let sync = single_chain(&chain, |c| c.options.events_query_size = 4).await;

        let batches: Vec<EventBatch> = sync
            .historical_events()
            .unwrap()
            .into_stream()
            .map(|b| b.unwrap())
            .collect()
            .await;
        let events: usize = batches.iter().map(|b| b.events.len()).sum();
        assert_eq!(events, 25);
        assert!(batches.len() > 1);
        assert_eq!(sync.progress(1).unwrap().current.unwrap().number, 25);
    }

    #[tokio::test]
    async fn event_paging_recovers_within_retry_limit() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 30);
        let sync = single_chain_with_store(&chain, Arc::new(UnreliableEvents::new(2)), retry_options).await;

        let mut stream = sync.historical_events().unwrap();
        let mut events = 0;
        while let Some(batch) = stream.next_batch().await.unwrap() {
            events += batch.events.len();
        }
        assert_eq!(events, 25);
    }

    #[tokio::test]
    async fn event_paging_fails_past_retry_limit() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 30);
        let sync = single_chain_with_store(&chain, Arc::new(UnreliableEvents::new(3)), retry_options).await;

        let mut stream = sync.historical_events().unwrap();
        let err = stream.next_batch().await.unwrap_err();
        assert!(matches!(err, SyncError::Storage(_)));
        // 1000 s halved once per failure.
        assert_eq!(stream.estimate_seconds, 125);
    }

    #[tokio::test]
    async fn stale_finalized_block_is_refetched() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 20);
        let sync = single_chain(&chain, |c| c.options.handoff_stale_seconds = 0).await;
        assert_eq!(sync.progress(1).unwrap().finalized.number, 15);

        mine(&chain, 5);
        let mut stream = sync.historical_events().unwrap();
        let mut events = 0;
        while let Some(batch) = stream.next_batch().await.unwrap() {
            events += batch.events.len();
        }
        assert_eq!(events, 20);
        assert_eq!(sync.progress(1).unwrap().finalized.number, 20);
    }

    #[tokio::test]
    async fn initial_checkpoint_skips_delivered_events() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 10);
        let resume = Checkpoint::for_block(
            &chain.block(3).unwrap(),
            1,
            omnisync_core::checkpoint::Rounding::Up,
        )
        .encode();
        let sync = single_chain(&chain, |c| c.options.initial_checkpoint = Some(resume.clone())).await;

        let mut stream = sync.historical_events().unwrap();
        let batch = stream.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.events[0].block.number, 4);
    }

    #[tokio::test]
    async fn malformed_initial_checkpoint_is_rejected() {
        let client: Arc<dyn ChainClient> = Arc::new(InMemoryChain::new(1));
        let config = SyncConfig {
            networks: vec![NetworkConfig::new("mainnet", 1)],
            sources: vec![Source::new("token", LogFilter::address(1, TOKEN))],
            options: omnisync_core::config::SyncOptions {
                initial_checkpoint: Some("not a checkpoint".into()),
                ..Default::default()
            },
            ..SyncConfig::default()
        };
        let result = Sync::new(
            config,
            BTreeMap::from([(1, client)]),
            Arc::new(InMemoryStore::new()),
            Arc::new(LogConsumer),
        )
        .await;
        assert!(matches!(result, Err(SyncError::Checkpoint(_))));
    }

    #[tokio::test]
    async fn kill_stops_the_historical_stream() {
        let chain = Arc::new(InMemoryChain::new(1));
        mine(&chain, 10);
        let sync = single_chain(&chain, |_| {}).await;
        let mut stream = sync.historical_events().unwrap();
        sync.kill().await;
        assert!(stream.next_batch().await.unwrap().is_none());
    }
}
