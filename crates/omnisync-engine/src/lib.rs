//! omnisync-engine — the multi-chain sync engine.
//!
//! A [`Sync`] backfills every configured chain into a [`SyncStore`], streams
//! the stored events in one global checkpoint order, then follows each
//! chain's tip and reports blocks, finalizations and reorgs to a
//! [`SyncConsumer`].
//!
//! ```rust,no_run
//! # async fn run(sync: omnisync_engine::Sync) -> Result<(), omnisync_core::SyncError> {
//! let mut events = sync.historical_events()?;
//! while let Some(batch) = events.next_batch().await? {
//!     println!("{} events up to {}", batch.events.len(), batch.checkpoint);
//! }
//! sync.start_realtime().await?;
//! # Ok(()) }
//! ```
//!
//! [`SyncStore`]: omnisync_core::store::SyncStore

pub mod builder;
pub mod cached;
pub mod consumer;
pub mod diagnostic;
pub mod factory;
pub mod historical;
pub mod memory_chain;
pub mod omnichain;
pub mod queue;
pub mod realtime;
pub mod sync;
pub mod tracker;

pub use builder::SyncBuilder;
pub use cached::CachedClient;
pub use consumer::{
    ChainStatus, ChannelConsumer, ConsumerMessage, EventBatch, LogConsumer, RealtimeEvent, Status,
    StatusBlock, SyncConsumer,
};
pub use factory::ChildAddresses;
pub use historical::{HistoricalStep, HistoricalSync, LocalHistoricalSync};
pub use memory_chain::{EmittedLog, InMemoryChain};
pub use omnichain::{split_events, ChainState, OmnichainState};
pub use queue::RequestQueue;
pub use realtime::{RealtimeSync, RealtimeSyncEvent};
pub use sync::{HistoricalEvents, Sync};
pub use tracker::BlockTracker;
