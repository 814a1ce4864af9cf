//! Startup probe: where a chain's sync starts, ends, and is finalized.

use tracing::{debug, warn};

use omnisync_core::checkpoint::Checkpoint;
use omnisync_core::client::{BlockSelector, ChainClient};
use omnisync_core::config::NetworkConfig;
use omnisync_core::error::SyncError;
use omnisync_core::filter::Source;
use omnisync_core::types::LightBlock;

/// Result of [`sync_diagnostic`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub start: LightBlock,
    pub end: Option<LightBlock>,
    pub finalized: LightBlock,
}

pub(crate) async fn fetch_block(
    client: &dyn ChainClient,
    chain_id: u64,
    selector: BlockSelector,
) -> Result<LightBlock, SyncError> {
    client
        .get_block(selector)
        .await?
        .map(|b| b.light())
        .ok_or_else(|| SyncError::Rpc(format!("block {selector:?} not found on chain {chain_id}")))
}

/// `latest - finality_block_count`, floored at genesis.
pub async fn finalized_block(
    network: &NetworkConfig,
    client: &dyn ChainClient,
) -> Result<LightBlock, SyncError> {
    let latest = fetch_block(client, network.chain_id, BlockSelector::Latest).await?;
    let number = latest.number.saturating_sub(network.finality_block_count);
    fetch_block(client, network.chain_id, BlockSelector::Number(number)).await
}

/// Probe a chain for the blocks that bound its sync.
///
/// The start is the earliest `from_block` of `sources`; the end is the latest
/// `to_block`, or `None` when any source follows the tip. An end beyond the
/// current tip is represented by a placeholder block with hash `0x` and the
/// largest timestamp, so it sorts after everything.
pub async fn sync_diagnostic(
    network: &NetworkConfig,
    sources: &[Source],
    client: &dyn ChainClient,
) -> Result<Diagnostic, SyncError> {
    let chain_id = network.chain_id;
    let start = sources
        .iter()
        .map(|s| s.filter.from_block.unwrap_or(0))
        .min()
        .unwrap_or(0);
    let end = if sources.iter().any(|s| s.filter.to_block.is_none()) {
        None
    } else {
        sources.iter().filter_map(|s| s.filter.to_block).max()
    };

    let (remote_chain_id, start_block, latest) = tokio::try_join!(
        client.chain_id(),
        fetch_block(client, chain_id, BlockSelector::Number(start)),
        fetch_block(client, chain_id, BlockSelector::Latest),
    )?;

    if remote_chain_id != chain_id {
        warn!(
            network = %network.name,
            configured = chain_id,
            remote = remote_chain_id,
            "remote chain id does not match configured chain id"
        );
    }

    let end_block = match end {
        None => None,
        Some(end) if end > latest.number => Some(LightBlock {
            number: end,
            hash: "0x".into(),
            parent_hash: "0x".into(),
            timestamp: Checkpoint::MAX_TIMESTAMP,
        }),
        Some(end) => Some(fetch_block(client, chain_id, BlockSelector::Number(end)).await?),
    };

    let finalized_number = latest.number.saturating_sub(network.finality_block_count);
    let finalized = fetch_block(client, chain_id, BlockSelector::Number(finalized_number)).await?;

    debug!(
        chain_id,
        start = start_block.number,
        end = ?end_block.as_ref().map(|b| b.number),
        finalized = finalized.number,
        latest = latest.number,
        "sync diagnostic"
    );
    Ok(Diagnostic {
        start: start_block,
        end: end_block,
        finalized,
    })
}
