//! Per-chain sync progress and the checkpoints derived from it.

use serde::{Deserialize, Serialize};

use crate::checkpoint::{Checkpoint, Rounding};
use crate::types::LightBlock;

/// Which progress marker to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressTag {
    Start,
    Current,
    Finalized,
    End,
}

/// Where one chain's sync stands.
///
/// `start ≤ current ≤ finalized` once `current` is set. `end` is the
/// configured upper bound, `cached` the furthest block an earlier run fully
/// persisted for every source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub start: LightBlock,
    pub end: Option<LightBlock>,
    pub finalized: LightBlock,
    pub cached: Option<LightBlock>,
    pub current: Option<LightBlock>,
}

impl SyncProgress {
    /// `true` once `current` reached the configured end block.
    pub fn is_end(&self) -> bool {
        match (&self.end, &self.current) {
            (Some(end), Some(current)) => current.number >= end.number,
            _ => false,
        }
    }

    /// `true` once `current` reached the finalized block.
    pub fn is_finalized(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|current| current.number >= self.finalized.number)
    }

    /// The closest-to-tip block covered by the historical phase:
    /// `min(end, finalized)`.
    pub fn historical_last(&self) -> &LightBlock {
        match &self.end {
            Some(end) if end.number <= self.finalized.number => end,
            _ => &self.finalized,
        }
    }

    /// `true` when the start block is beyond the finalized block, leaving
    /// nothing safe to backfill.
    pub fn start_is_unfinalized(&self) -> bool {
        self.start.number > self.finalized.number
    }

    pub fn block(&self, tag: ProgressTag) -> Option<&LightBlock> {
        match tag {
            ProgressTag::Start => Some(&self.start),
            ProgressTag::Current => self.current.as_ref(),
            ProgressTag::Finalized => Some(&self.finalized),
            ProgressTag::End => self.end.as_ref(),
        }
    }

    /// Encoded checkpoint for `tag` on this chain.
    ///
    /// Meant for closed intervals: `Start` rounds down, everything else up.
    /// `End` is `None` without an end block; `Current` is `None` before the
    /// first block and after the chain reached its end.
    pub fn checkpoint(&self, chain_id: u64, tag: ProgressTag) -> Option<String> {
        if tag == ProgressTag::Current && self.is_end() {
            return None;
        }
        let rounding = match tag {
            ProgressTag::Start => Rounding::Down,
            _ => Rounding::Up,
        };
        self.block(tag)
            .map(|block| Checkpoint::for_block(block, chain_id, rounding).encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> LightBlock {
        LightBlock {
            number,
            hash: format!("0x{number}"),
            parent_hash: format!("0x{}", number.saturating_sub(1)),
            timestamp: 1_000 + number * 2,
        }
    }

    fn progress(end: Option<u64>, finalized: u64, current: Option<u64>) -> SyncProgress {
        SyncProgress {
            start: block(0),
            end: end.map(block),
            finalized: block(finalized),
            cached: None,
            current: current.map(block),
        }
    }

    #[test]
    fn end_and_finalized_flags() {
        assert!(!progress(None, 100, Some(100)).is_end());
        assert!(progress(None, 100, Some(100)).is_finalized());
        assert!(!progress(Some(50), 100, Some(49)).is_end());
        assert!(progress(Some(50), 100, Some(50)).is_end());
        assert!(!progress(Some(50), 100, None).is_finalized());
    }

    #[test]
    fn historical_last_is_min_of_end_and_finalized() {
        assert_eq!(progress(None, 100, None).historical_last().number, 100);
        assert_eq!(progress(Some(50), 100, None).historical_last().number, 50);
        assert_eq!(progress(Some(500), 100, None).historical_last().number, 100);
    }

    #[test]
    fn checkpoint_rounding() {
        let p = progress(Some(200), 100, Some(40));
        let start = Checkpoint::decode(&p.checkpoint(1, ProgressTag::Start).unwrap()).unwrap();
        assert_eq!(start.transaction_index, 0);
        let current = Checkpoint::decode(&p.checkpoint(1, ProgressTag::Current).unwrap()).unwrap();
        assert_eq!(current.block_number, 40);
        assert_eq!(current.transaction_index, Checkpoint::MAX.transaction_index);
    }

    #[test]
    fn checkpoint_undefined_tags() {
        assert!(progress(None, 100, Some(10)).checkpoint(1, ProgressTag::End).is_none());
        assert!(progress(None, 100, None).checkpoint(1, ProgressTag::Current).is_none());
        // A chain that reached its end no longer bounds the omnichain cursor.
        assert!(progress(Some(50), 100, Some(50)).checkpoint(1, ProgressTag::Current).is_none());
    }
}
