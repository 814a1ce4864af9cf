//! omnisync-core — foundation for the multi-chain, reorg-aware sync engine.
//!
//! # Architecture
//!
//! ```text
//! Sync (omnisync-engine)
//!   ├── HistoricalSync   (adaptive-range backfill, interval cache)
//!   ├── RealtimeSync     (tip polling, finalize / reorg detection)
//!   ├── OmnichainState   (pending / executed events, per-chain progress)
//!   └── SyncStore        (memory / SQLite, omnisync-storage)
//!
//! omnisync-core
//!   ├── checkpoint  (75-char total-order event key)
//!   ├── interval    (closed block range algebra)
//!   ├── progress    (per-chain SyncProgress + omnichain tags)
//!   ├── filter      (log / factory filters and their fragments)
//!   ├── store       (SyncStore contract)
//!   └── client      (ChainClient contract)
//! ```

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod estimate;
pub mod filter;
pub mod interval;
pub mod progress;
pub mod store;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointError, Rounding};
pub use client::{BlockSelector, ChainClient, LogQuery};
pub use config::{NetworkConfig, SyncConfig, SyncOptions};
pub use error::SyncError;
pub use filter::{ChildAddressLocation, Factory, Fragment, LogAddress, LogFilter, Source};
pub use interval::Interval;
pub use progress::{ProgressTag, SyncProgress};
pub use store::{EventPage, EventQuery, LogRecord, SyncBatch, SyncStore};
pub use types::{
    Block, LightBlock, Log, RawEvent, Trace, Transaction, TransactionReceipt, UnfinalizedBlock,
};
