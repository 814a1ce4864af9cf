//! Checkpoint codec: the total-order key shared by every chain.
//!
//! A checkpoint orders events by `(block_timestamp, chain_id, block_number,
//! transaction_index, event_type, event_index)`. The encoded form is a
//! fixed-width decimal string, so comparing two encoded checkpoints as strings
//! gives the same answer as comparing the tuples. The store sorts and pages on
//! the encoded form directly.
//!
//! ```text
//! | timestamp (10) | chain id (16) | block (16) | tx index (16) | type (1) | event index (16) |
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::LightBlock;

const BLOCK_TIMESTAMP_DIGITS: usize = 10;
const CHAIN_ID_DIGITS: usize = 16;
const BLOCK_NUMBER_DIGITS: usize = 16;
const TRANSACTION_INDEX_DIGITS: usize = 16;
const EVENT_TYPE_DIGITS: usize = 1;
const EVENT_INDEX_DIGITS: usize = 16;

/// Length of an encoded checkpoint.
pub const CHECKPOINT_LENGTH: usize = BLOCK_TIMESTAMP_DIGITS
    + CHAIN_ID_DIGITS
    + BLOCK_NUMBER_DIGITS
    + TRANSACTION_INDEX_DIGITS
    + EVENT_TYPE_DIGITS
    + EVENT_INDEX_DIGITS;

const MAX_TIMESTAMP: u64 = 9_999_999_999;
const MAX_16_DIGITS: u64 = 9_999_999_999_999_999;

/// Event type digits used in the `event_type` slot.
pub mod event_type {
    pub const TRANSACTION: u8 = 2;
    pub const LOG: u8 = 5;
    pub const TRACE: u8 = 7;
}

/// Decoding failure. Inside the engine this is always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint must be 75 characters, got {0}")]
    Length(usize),

    #[error("checkpoint contains a non-digit character: {0:?}")]
    NonDigit(String),
}

/// Whether a block checkpoint should sit before or after every event in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Zero sub-block fields, the inclusive start of a range.
    Down,
    /// Maximum sub-block fields, the inclusive end of a range.
    Up,
}

/// A decoded checkpoint. Field order is the comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_timestamp: u64,
    pub chain_id: u64,
    pub block_number: u64,
    pub transaction_index: u64,
    pub event_type: u8,
    pub event_index: u64,
}

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        transaction_index: 0,
        event_type: 0,
        event_index: 0,
    };

    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: MAX_TIMESTAMP,
        chain_id: MAX_16_DIGITS,
        block_number: MAX_16_DIGITS,
        transaction_index: MAX_16_DIGITS,
        event_type: 9,
        event_index: MAX_16_DIGITS,
    };

    /// The largest representable block timestamp.
    pub const MAX_TIMESTAMP: u64 = MAX_TIMESTAMP;

    /// Checkpoint of a whole block, rounded to sit before or after its events.
    pub fn for_block(block: &LightBlock, chain_id: u64, rounding: Rounding) -> Self {
        let base = match rounding {
            Rounding::Down => Self::ZERO,
            Rounding::Up => Self::MAX,
        };
        Self {
            block_timestamp: block.timestamp,
            chain_id,
            block_number: block.number,
            ..base
        }
    }

    /// Zero checkpoint at a given timestamp. Used to turn a time window into a bound.
    pub fn at_timestamp(block_timestamp: u64) -> Self {
        Self {
            block_timestamp: block_timestamp.min(MAX_TIMESTAMP),
            ..Self::ZERO
        }
    }

    /// Encode into the fixed-width sortable form.
    ///
    /// Fields wider than their slot break ordering, so callers must stay within
    /// [`Checkpoint::MAX`].
    pub fn encode(&self) -> String {
        debug_assert!(self.block_timestamp <= MAX_TIMESTAMP);
        debug_assert!(self.chain_id <= MAX_16_DIGITS);
        debug_assert!(self.block_number <= MAX_16_DIGITS);
        debug_assert!(self.transaction_index <= MAX_16_DIGITS);
        debug_assert!(self.event_type <= 9);
        debug_assert!(self.event_index <= MAX_16_DIGITS);
        format!(
            "{:0>10}{:0>16}{:0>16}{:0>16}{}{:0>16}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_type,
            self.event_index,
        )
    }

    /// Decode an encoded checkpoint.
    pub fn decode(encoded: &str) -> Result<Self, CheckpointError> {
        if encoded.len() != CHECKPOINT_LENGTH {
            return Err(CheckpointError::Length(encoded.len()));
        }
        if !encoded.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CheckpointError::NonDigit(encoded.to_string()));
        }

        let mut offset = 0;
        let mut take = |width: usize| -> u64 {
            let slice = &encoded[offset..offset + width];
            offset += width;
            // All digits and at most 16 of them, so this always fits in a u64.
            slice.bytes().fold(0u64, |acc, b| acc * 10 + u64::from(b - b'0'))
        };

        Ok(Self {
            block_timestamp: take(BLOCK_TIMESTAMP_DIGITS),
            chain_id: take(CHAIN_ID_DIGITS),
            block_number: take(BLOCK_NUMBER_DIGITS),
            transaction_index: take(TRANSACTION_INDEX_DIGITS),
            event_type: take(EVENT_TYPE_DIGITS) as u8,
            event_index: take(EVENT_INDEX_DIGITS),
        })
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Checkpoint {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Smallest of the defined encoded checkpoints, `None` if none are defined.
pub fn min_checkpoint<'a, I>(checkpoints: I) -> Option<String>
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    checkpoints.into_iter().flatten().min().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(ts: u64, chain: u64, block: u64, tx: u64, ty: u8, idx: u64) -> Checkpoint {
        Checkpoint {
            block_timestamp: ts,
            chain_id: chain,
            block_number: block,
            transaction_index: tx,
            event_type: ty,
            event_index: idx,
        }
    }

    #[test]
    fn encode_is_fixed_width() {
        assert_eq!(Checkpoint::ZERO.encode().len(), CHECKPOINT_LENGTH);
        assert_eq!(Checkpoint::MAX.encode().len(), CHECKPOINT_LENGTH);
        assert_eq!(cp(1, 1, 1, 1, 5, 1).encode().len(), CHECKPOINT_LENGTH);
    }

    #[test]
    fn roundtrip_extremes() {
        for c in [Checkpoint::ZERO, Checkpoint::MAX, cp(1_700_000_000, 10, 123_456, 7, 5, 42)] {
            assert_eq!(Checkpoint::decode(&c.encode()).unwrap(), c);
        }
    }

    #[test]
    fn string_order_matches_tuple_order() {
        let samples = vec![
            cp(100, 1, 10, 0, 5, 0),
            cp(100, 1, 10, 0, 5, 1),
            cp(100, 1, 10, 1, 2, 0),
            cp(100, 1, 11, 0, 5, 0),
            cp(100, 2, 1, 0, 5, 0),
            cp(101, 1, 1, 0, 5, 0),
            cp(99, 137, 50_000_000, 200, 7, 9),
            Checkpoint::ZERO,
            Checkpoint::MAX,
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(a.cmp(b), a.encode().cmp(&b.encode()), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn timestamp_dominates_chain_id() {
        let early_big_chain = cp(100, 42_161, 1, 0, 5, 0);
        let late_small_chain = cp(101, 1, 1, 0, 5, 0);
        assert!(early_big_chain.encode() < late_small_chain.encode());
    }

    #[test]
    fn block_rounding_brackets_its_events() {
        let block = LightBlock {
            number: 10,
            hash: "0xa".into(),
            parent_hash: "0x9".into(),
            timestamp: 1_000,
        };
        let down = Checkpoint::for_block(&block, 1, Rounding::Down).encode();
        let up = Checkpoint::for_block(&block, 1, Rounding::Up).encode();
        let event = cp(1_000, 1, 10, 3, event_type::LOG, 2).encode();
        assert!(down < event && event < up);
    }

    #[test]
    fn decode_rejects_malformed() {
        assert_eq!(Checkpoint::decode("123"), Err(CheckpointError::Length(3)));
        let mut bad = Checkpoint::ZERO.encode();
        bad.replace_range(0..1, "x");
        assert!(matches!(Checkpoint::decode(&bad), Err(CheckpointError::NonDigit(_))));
    }

    #[test]
    fn min_checkpoint_skips_undefined() {
        let a = cp(5, 1, 1, 0, 0, 0).encode();
        let b = cp(3, 1, 1, 0, 0, 0).encode();
        assert_eq!(min_checkpoint([Some(a.as_str()), None, Some(b.as_str())]), Some(b));
        assert_eq!(min_checkpoint([None, None]), None);
    }
}
