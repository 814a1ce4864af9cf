//! Backend-independent event materialization.
//!
//! Both backends page logs by checkpoint and hand each one here to be matched
//! against the query's sources and joined with its block and transaction.

use std::collections::HashMap;

use omnisync_core::error::SyncError;
use omnisync_core::filter::{Factory, Source};
use omnisync_core::types::{Block, Log, RawEvent, Transaction};

/// Child addresses per factory, with the first block each was announced in.
#[derive(Debug, Default)]
pub(crate) struct ChildIndex {
    by_factory: HashMap<String, HashMap<String, u64>>,
}

impl ChildIndex {
    /// Record `log` if it is a creation event of `factory`.
    pub(crate) fn observe(&mut self, factory: &Factory, log: &Log) {
        if let Some(child) = factory.child_address(log) {
            let first = self
                .by_factory
                .entry(factory.id())
                .or_default()
                .entry(child)
                .or_insert(log.block_number);
            *first = (*first).min(log.block_number);
        }
    }

    /// `true` if `address` was announced by `factory` at or before `block`.
    pub(crate) fn contains(&self, factory: &Factory, address: &str, block: u64) -> bool {
        self.by_factory
            .get(&factory.id())
            .and_then(|children| children.get(address))
            .is_some_and(|first| *first <= block)
    }

    pub(crate) fn addresses(&self, factory: &Factory, to_block: u64) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .by_factory
            .get(&factory.id())
            .map(|children| {
                children
                    .iter()
                    .filter(|(_, first)| **first <= to_block)
                    .map(|(address, _)| address.clone())
                    .collect()
            })
            .unwrap_or_default();
        addresses.sort();
        addresses
    }
}

/// Factories referenced by sources on `chain_id`.
pub(crate) fn factories_for(sources: &[Source], chain_id: u64) -> Vec<&Factory> {
    let mut factories: Vec<&Factory> = sources
        .iter()
        .filter(|s| s.chain_id() == chain_id)
        .filter_map(|s| s.filter.factory_ref())
        .collect();
    factories.sort_by_key(|f| f.id());
    factories.dedup_by_key(|f| f.id());
    factories
}

/// Sources on `chain_id` that accept `log`.
pub(crate) fn matching_sources<'a>(
    sources: &'a [Source],
    chain_id: u64,
    log: &Log,
    children: &ChildIndex,
) -> Vec<&'a Source> {
    sources
        .iter()
        .filter(|s| s.chain_id() == chain_id)
        .filter(|s| {
            s.filter
                .matches(log, |factory, address| children.contains(factory, address, log.block_number))
        })
        .collect()
}

/// One event per matching source.
pub(crate) fn build_events(
    sources: &[&Source],
    chain_id: u64,
    checkpoint: &str,
    log: &Log,
    block: Option<&Block>,
    transaction: Option<&Transaction>,
) -> Result<Vec<RawEvent>, SyncError> {
    if sources.is_empty() {
        return Ok(Vec::new());
    }
    let block = block.ok_or_else(|| {
        SyncError::malformed(chain_id, format!("block {} of log {} is missing", log.block_number, log.id()))
    })?;
    let transaction = transaction.ok_or_else(|| {
        SyncError::malformed(
            chain_id,
            format!("transaction {} of log {} is missing", log.transaction_hash, log.id()),
        )
    })?;
    let block = block.without_transactions();

    Ok(sources
        .iter()
        .map(|source| RawEvent {
            chain_id,
            source_id: source.name.clone(),
            checkpoint: checkpoint.to_string(),
            log: log.clone(),
            block: block.clone(),
            transaction: transaction.clone(),
        })
        .collect())
}
