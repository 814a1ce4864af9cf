//! Block tracker: the finalized block plus the unfinalized chain above it,
//! used for parent-hash verification and reorg detection in realtime.

use std::collections::VecDeque;

use omnisync_core::types::LightBlock;

/// Tracks every unfinalized block of one chain.
///
/// When a new block arrives, the tracker checks whether its `parent_hash`
/// matches the hash of the current head. A mismatch means a reorg occurred.
/// The window has no fixed size: it is trimmed by [`BlockTracker::finalize`].
#[derive(Debug, Clone)]
pub struct BlockTracker {
    finalized: LightBlock,
    /// Unfinalized blocks, oldest first. The first one extends `finalized`.
    window: VecDeque<LightBlock>,
}

impl BlockTracker {
    /// Start tracking above `finalized`.
    pub fn new(finalized: LightBlock) -> Self {
        Self {
            finalized,
            window: VecDeque::new(),
        }
    }

    /// Add a new block on top of the head.
    ///
    /// Returns `Err(depth)` if the block does not extend the head, where
    /// `depth` is how many tracked blocks sit above the block's parent
    /// (the whole window if the parent is unknown).
    pub fn push(&mut self, block: LightBlock) -> Result<(), u64> {
        if !block.extends(self.head()) {
            return Err(self.find_reorg_depth(&block));
        }
        self.window.push_back(block);
        Ok(())
    }

    /// The newest block, or the finalized block when nothing is unfinalized.
    pub fn head(&self) -> &LightBlock {
        self.window.back().unwrap_or(&self.finalized)
    }

    pub fn finalized(&self) -> &LightBlock {
        &self.finalized
    }

    /// A tracked block by number, the finalized block included.
    pub fn get(&self, number: u64) -> Option<&LightBlock> {
        if number == self.finalized.number {
            return Some(&self.finalized);
        }
        self.window.iter().find(|b| b.number == number)
    }

    /// Unfinalized blocks, oldest first.
    pub fn unfinalized(&self) -> impl DoubleEndedIterator<Item = &LightBlock> {
        self.window.iter()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Discard everything above `block_number`, returning the dropped blocks
    /// oldest first.
    pub fn rewind_to(&mut self, block_number: u64) -> Vec<LightBlock> {
        let keep = self
            .window
            .iter()
            .take_while(|b| b.number <= block_number)
            .count();
        self.window.split_off(keep).into()
    }

    /// Make the tracked block `block_number` the new finalized block and drop
    /// everything below it. Returns the new finalized block, or `None` if
    /// `block_number` is not tracked above the current finalized block.
    pub fn finalize(&mut self, block_number: u64) -> Option<LightBlock> {
        let position = self.window.iter().position(|b| b.number == block_number)?;
        let mut settled = self.window.drain(..=position);
        let finalized = settled.next_back()?;
        drop(settled);
        self.finalized = finalized.clone();
        Some(finalized)
    }

    fn find_reorg_depth(&self, new_block: &LightBlock) -> u64 {
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.hash == new_block.parent_hash {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        self.window.len() as u64
    }
}
