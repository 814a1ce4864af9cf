//! Child-address tracking for factory filters.
//!
//! Each factory's children live in two layers: the finalized layer loaded
//! from the store when realtime starts, and an unfinalized delta keyed by the
//! block that announced each address. Finalize folds the delta into the
//! finalized layer; a reorg drops the part of the delta above the ancestor.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use omnisync_core::error::SyncError;
use omnisync_core::filter::Factory;
use omnisync_core::store::SyncStore;
use omnisync_core::types::Log;

#[derive(Debug, Default, Clone)]
pub struct ChildAddresses {
    /// factory id → children at or below the finalized block.
    finalized: HashMap<String, HashSet<String>>,
    /// announcing block → (factory id, child).
    unfinalized: BTreeMap<u64, Vec<(String, String)>>,
}

impl ChildAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the finalized layer for `factories` up to `finalized_block`.
    pub async fn resolve(
        store: &dyn SyncStore,
        chain_id: u64,
        factories: &[Factory],
        finalized_block: u64,
    ) -> Result<Self, SyncError> {
        let mut addresses = Self::new();
        for factory in factories {
            let children = store
                .get_child_addresses(chain_id, factory, finalized_block)
                .await?;
            debug!(chain_id, factory = %factory.id(), children = children.len(), "resolved child addresses");
            addresses
                .finalized
                .entry(factory.id())
                .or_default()
                .extend(children);
        }
        Ok(addresses)
    }

    /// Fold the creation logs of one unfinalized block into the delta.
    /// Returns how many children were announced.
    pub fn record(&mut self, block_number: u64, factories: &[Factory], logs: &[Log]) -> usize {
        let mut found = Vec::new();
        for log in logs {
            for factory in factories {
                if let Some(child) = factory.child_address(log) {
                    found.push((factory.id(), child));
                }
            }
        }
        let count = found.len();
        if count > 0 {
            self.unfinalized.entry(block_number).or_default().extend(found);
        }
        count
    }

    /// Move children announced at or below `block_number` into the finalized layer.
    pub fn finalize(&mut self, block_number: u64) {
        let above = match block_number.checked_add(1) {
            Some(next) => self.unfinalized.split_off(&next),
            None => BTreeMap::new(),
        };
        let settled = std::mem::replace(&mut self.unfinalized, above);
        for (factory_id, child) in settled.into_values().flatten() {
            self.finalized.entry(factory_id).or_default().insert(child);
        }
    }

    /// Forget children announced above `ancestor`.
    pub fn rollback(&mut self, ancestor: u64) {
        if let Some(next) = ancestor.checked_add(1) {
            self.unfinalized.split_off(&next);
        }
    }

    /// `true` if `address` (lowercase) is a known child of `factory`.
    pub fn contains(&self, factory: &Factory, address: &str) -> bool {
        let id = factory.id();
        self.finalized
            .get(&id)
            .is_some_and(|children| children.contains(address))
            || self
                .unfinalized
                .values()
                .flatten()
                .any(|(factory_id, child)| *factory_id == id && child == address)
    }

    pub fn unfinalized_len(&self) -> usize {
        self.unfinalized.values().map(Vec::len).sum()
    }
}
