//! Shared chain data types for the sync pipeline.

use serde::{Deserialize, Serialize};

use crate::checkpoint::{event_type, Checkpoint};
use crate::error::SyncError;

// ─── LightBlock ──────────────────────────────────────────────────────────────

/// The minimum description of a block needed to track progress.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LightBlock {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: u64,
}

impl LightBlock {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &LightBlock) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }

    /// Block time as a UTC datetime, `None` if out of chrono's range.
    pub fn datetime(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp(i64::try_from(self.timestamp).ok()?, 0)
    }
}

// ─── Block ───────────────────────────────────────────────────────────────────

/// A full block as returned by the chain client, with its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: u64,
    /// Block producer address.
    pub miner: String,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub base_fee_per_gas: Option<u64>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn light(&self) -> LightBlock {
        LightBlock {
            number: self.number,
            hash: self.hash.clone(),
            parent_hash: self.parent_hash.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Same block without its transaction list.
    pub fn without_transactions(&self) -> Block {
        Block {
            transactions: Vec::new(),
            ..self.clone()
        }
    }

    /// Look up one of this block's transactions by hash.
    pub fn transaction(&self, hash: &str) -> Option<&Transaction> {
        self.transactions.iter().find(|t| t.hash == hash)
    }
}

// ─── Transaction / receipt / trace ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u32,
    pub from: String,
    /// `None` for contract creations.
    pub to: Option<String>,
    pub input: String,
    /// Decimal wei value.
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u32,
    /// `true` when execution succeeded.
    pub status: bool,
    pub gas_used: u64,
    pub contract_address: Option<String>,
}

/// A call trace inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub transaction_hash: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_index: u32,
    /// Position of this call in the transaction's flattened call tree.
    pub trace_index: u32,
    pub call_type: String,
    pub from: String,
    pub to: Option<String>,
    pub input: String,
    pub output: Option<String>,
}

impl Trace {
    pub fn checkpoint(&self, block: &LightBlock, chain_id: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp: block.timestamp,
            chain_id,
            block_number: block.number,
            transaction_index: u64::from(self.transaction_index),
            event_type: event_type::TRACE,
            event_index: u64::from(self.trace_index),
        }
    }
}

// ─── Log ─────────────────────────────────────────────────────────────────────

/// An event log. The two indices are optional because pending logs from some
/// providers omit them; such logs cannot be ordered and are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: Option<u32>,
    pub log_index: Option<u32>,
}

impl Log {
    /// Store key for the log: `<block hash>-<log index>`.
    pub fn id(&self) -> String {
        format!("{}-{}", self.block_hash, self.log_index.unwrap_or_default())
    }

    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }

    /// Checkpoint of this log inside `block`.
    pub fn checkpoint(&self, block: &LightBlock, chain_id: u64) -> Result<Checkpoint, SyncError> {
        let transaction_index = self.transaction_index.ok_or_else(|| {
            SyncError::malformed(chain_id, format!("log {} has no transaction index", self.id()))
        })?;
        let log_index = self.log_index.ok_or_else(|| {
            SyncError::malformed(
                chain_id,
                format!("log in tx {} has no log index", self.transaction_hash),
            )
        })?;
        Ok(Checkpoint {
            block_timestamp: block.timestamp,
            chain_id,
            block_number: block.number,
            transaction_index: u64::from(transaction_index),
            event_type: event_type::LOG,
            event_index: u64::from(log_index),
        })
    }
}

// ─── RawEvent ────────────────────────────────────────────────────────────────

/// A fully materialized event, ready to be handed to the downstream processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub chain_id: u64,
    /// Name of the [`Source`](crate::filter::Source) that matched.
    pub source_id: String,
    /// Encoded checkpoint.
    pub checkpoint: String,
    pub log: Log,
    /// The containing block, without its transaction list.
    pub block: Block,
    pub transaction: Transaction,
}

// ─── UnfinalizedBlock ────────────────────────────────────────────────────────

/// A block ingested in realtime together with everything matched in it.
///
/// Held by the chain's realtime buffer until it is finalized (persisted) or
/// reorged out (discarded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfinalizedBlock {
    pub block: Block,
    /// Logs matching at least one source (superset for factory sources).
    pub logs: Vec<Log>,
    /// Factory creation logs that announce child addresses.
    pub factory_logs: Vec<Log>,
    pub transactions: Vec<Transaction>,
    pub transaction_receipts: Vec<TransactionReceipt>,
    pub traces: Vec<Trace>,
    /// `true` when any source matched something in this block.
    pub has_matched_filter: bool,
}

impl UnfinalizedBlock {
    pub fn light(&self) -> LightBlock {
        self.block.light()
    }

    pub fn number(&self) -> u64 {
        self.block.number
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn light(number: u64, hash: &str, parent: &str) -> LightBlock {
        LightBlock {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number * 12,
        }
    }

    fn log(tx_index: Option<u32>, log_index: Option<u32>) -> Log {
        Log {
            address: "0xtoken".into(),
            topics: vec!["0xddf2".into()],
            data: "0x".into(),
            block_number: 100,
            block_hash: "0xblock".into(),
            transaction_hash: "0xtx".into(),
            transaction_index: tx_index,
            log_index,
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = light(100, "0xaaa", "0x000");
        let child = light(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn block_extends_false_on_gap() {
        let a = light(100, "0xaaa", "0x000");
        let b = light(102, "0xccc", "0xaaa");
        assert!(!b.extends(&a));
    }

    #[test]
    fn log_checkpoint_uses_block_time_and_indices() {
        let block = light(100, "0xblock", "0x99");
        let cp = log(Some(3), Some(7)).checkpoint(&block, 10).unwrap();
        assert_eq!(cp.block_timestamp, 1_200);
        assert_eq!(cp.chain_id, 10);
        assert_eq!(cp.transaction_index, 3);
        assert_eq!(cp.event_type, event_type::LOG);
        assert_eq!(cp.event_index, 7);
    }

    #[test]
    fn log_without_indices_is_malformed() {
        let block = light(100, "0xblock", "0x99");
        let err = log(None, Some(1)).checkpoint(&block, 1).unwrap_err();
        assert!(matches!(err, SyncError::MalformedData { chain_id: 1, .. }));
        let err = log(Some(1), None).checkpoint(&block, 1).unwrap_err();
        assert!(matches!(err, SyncError::MalformedData { .. }));
    }

    #[test]
    fn light_block_datetime() {
        let block = light(1, "0x1", "0x0");
        assert_eq!(block.datetime().unwrap().timestamp(), 12);
    }
}
