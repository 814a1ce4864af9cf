//! Downstream event delivery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info};

use omnisync_core::error::SyncError;
use omnisync_core::types::RawEvent;

/// Block reported in a chain's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBlock {
    pub number: u64,
    pub timestamp: u64,
}

/// Where delivery stands for one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    /// Latest block whose events have been delivered.
    pub block: Option<StatusBlock>,
    /// `true` once the network switched to realtime.
    pub ready: bool,
}

/// Status of every network, keyed by network name.
pub type Status = BTreeMap<String, ChainStatus>;

/// Events up to `checkpoint`, in checkpoint order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventBatch {
    pub events: Vec<RawEvent>,
    pub checkpoint: String,
}

/// What realtime sync tells the downstream processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// Every event up to `checkpoint` is now known; `events` are the new ones.
    Block {
        checkpoint: String,
        status: Status,
        events: Vec<RawEvent>,
    },
    /// Everything after `checkpoint` was reverted and will be re-delivered.
    Reorg { checkpoint: String },
    /// Nothing at or below `checkpoint` can be reorged anymore.
    Finalize { checkpoint: String },
}

impl RealtimeEvent {
    pub fn checkpoint(&self) -> &str {
        match self {
            Self::Block { checkpoint, .. }
            | Self::Reorg { checkpoint }
            | Self::Finalize { checkpoint } => checkpoint,
        }
    }
}

/// Receives realtime events, one at a time, in delivery order.
#[async_trait]
pub trait SyncConsumer: Send + Sync {
    async fn on_realtime_event(&self, event: RealtimeEvent) -> Result<(), SyncError>;

    /// Called once when a chain's pipeline halts on an unrecoverable error.
    async fn on_fatal_error(&self, error: SyncError);
}

/// Logs every event and error. Used when no consumer is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogConsumer;

#[async_trait]
impl SyncConsumer for LogConsumer {
    async fn on_realtime_event(&self, event: RealtimeEvent) -> Result<(), SyncError> {
        match &event {
            RealtimeEvent::Block { checkpoint, events, .. } => {
                if !events.is_empty() {
                    info!(checkpoint = %checkpoint, events = events.len(), "indexed events");
                }
            }
            RealtimeEvent::Reorg { checkpoint } => info!(checkpoint = %checkpoint, "reorg"),
            RealtimeEvent::Finalize { checkpoint } => info!(checkpoint = %checkpoint, "finalized"),
        }
        Ok(())
    }

    async fn on_fatal_error(&self, error: SyncError) {
        error!(error = %error, "sync halted");
    }
}

/// Something a [`ChannelConsumer`] forwards.
#[derive(Debug)]
pub enum ConsumerMessage {
    Event(RealtimeEvent),
    Fatal(SyncError),
}

/// Forwards everything into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelConsumer {
    sender: mpsc::UnboundedSender<ConsumerMessage>,
}

impl ChannelConsumer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConsumerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl SyncConsumer for ChannelConsumer {
    async fn on_realtime_event(&self, event: RealtimeEvent) -> Result<(), SyncError> {
        self.sender
            .send(ConsumerMessage::Event(event))
            .map_err(|_| SyncError::Other("consumer channel closed".into()))
    }

    async fn on_fatal_error(&self, error: SyncError) {
        let _ = self.sender.send(ConsumerMessage::Fatal(error));
    }
}
