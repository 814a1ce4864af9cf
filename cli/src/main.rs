//! omnisync CLI — inspect sync stores and configuration.
//!
//! Usage:
//! ```bash
//! omnisync validate  sync.json
//! omnisync intervals sync.db 1
//! omnisync events    sync.json sync.db 20
//! omnisync checkpoint 170000000000000000000000010000000000001234000000000000000550000000000000003
//! omnisync demo
//! omnisync info
//! ```

use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use omnisync_core::checkpoint::Checkpoint;
use omnisync_core::config::{NetworkConfig, SyncConfig, SyncOptions};
use omnisync_core::interval;
use omnisync_core::filter::{LogFilter, Source};
use omnisync_core::store::{EventQuery, SyncStore};
use omnisync_engine::{
    ChannelConsumer, ConsumerMessage, EmittedLog, InMemoryChain, RealtimeEvent, SyncBuilder,
};
use omnisync_storage::SqliteStore;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "validate" => cmd_validate(&args[2..]),
        "intervals" => cmd_intervals(&args[2..]).await,
        "events" => cmd_events(&args[2..]).await,
        "checkpoint" => cmd_checkpoint(&args[2..]),
        "demo" => cmd_demo().await,
        "version" | "--version" | "-V" => {
            println!("omnisync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("omnisync {}", env!("CARGO_PKG_VERSION"));
    println!("Multi-chain, reorg-aware blockchain sync engine\n");
    println!("USAGE:");
    println!("    omnisync <COMMAND>\n");
    println!("COMMANDS:");
    println!("    validate   <config.json>                  Check a sync configuration");
    println!("    intervals  <store.db> <chain_id>          Show synced block ranges per fragment");
    println!("    events     <config.json> <store.db> [n]   Print the first n stored events");
    println!("    checkpoint <encoded>                      Decode a checkpoint");
    println!("    demo       Sync two simulated chains, including a reorg");
    println!("    info       Show defaults");
    println!("    version    Print version");
    println!("    help       Print this help");
}

fn cmd_info() {
    let network = NetworkConfig::new("example", 1);
    let options = SyncOptions::default();
    println!("omnisync v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default finality: {} blocks", network.finality_block_count);
    println!("  Default poll interval: {} ms", network.poll_interval_ms);
    println!(
        "  Default request limits: {} req/s, {} concurrent",
        network.max_requests_per_second, network.max_concurrent_requests
    );
    println!("  Default events per batch: {}", options.events_query_size);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}

fn read_config(path: &str) -> Result<SyncConfig> {
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    SyncConfig::from_json(&json).with_context(|| format!("parsing {path}"))
}

fn cmd_validate(args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("usage: omnisync validate <config.json>");
    };
    let config = read_config(path)?;
    println!("{path}: ok");
    for network in &config.networks {
        println!(
            "  network {} (chain {}), finality {} blocks",
            network.name, network.chain_id, network.finality_block_count
        );
        for source in config.sources_for(network.chain_id) {
            let (from, to) = source.filter.block_range();
            let fragments = source.filter.fragments();
            println!(
                "    source {}: blocks {from}..={to}, {} fragment(s)",
                source.name,
                fragments.len()
            );
        }
    }
    Ok(())
}

async fn cmd_intervals(args: &[String]) -> Result<()> {
    let [path, chain_id, ..] = args else {
        bail!("usage: omnisync intervals <store.db> <chain_id>");
    };
    let chain_id: u64 = chain_id.parse().context("chain_id must be a number")?;
    let store = SqliteStore::open(path).await?;
    let fragments = store.fragment_intervals(chain_id).await?;
    if fragments.is_empty() {
        println!("no intervals stored for chain {chain_id}");
        return Ok(());
    }
    for (fragment, intervals) in fragments {
        println!("{fragment}  ({} blocks)", interval::sum(&intervals));
        for (start, end) in intervals {
            println!("    {start}..={end}");
        }
    }
    Ok(())
}

async fn cmd_events(args: &[String]) -> Result<()> {
    let [config_path, path, rest @ ..] = args else {
        bail!("usage: omnisync events <config.json> <store.db> [n]");
    };
    let limit = match rest.first() {
        Some(n) => n.parse().context("n must be a number")?,
        None => 20,
    };
    let config = read_config(config_path)?;
    let store = SqliteStore::open(path).await?;

    let page = store
        .get_events(&EventQuery {
            sources: config.sources.clone(),
            from: Checkpoint::ZERO.encode(),
            to: Checkpoint::MAX.encode(),
            limit,
        })
        .await?;
    println!("showing {} of {} stored events", page.events.len().min(limit), store.event_count().await?);
    for event in page.events.iter().take(limit) {
        let time = chrono::DateTime::from_timestamp(event.block.timestamp as i64, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!(
            "{}  chain {} block {} log {}  {}",
            event.checkpoint,
            event.chain_id,
            event.block.number,
            event.log.log_index.map_or_else(|| "-".to_string(), |i| i.to_string()),
            time
        );
    }
    Ok(())
}

fn cmd_checkpoint(args: &[String]) -> Result<()> {
    let Some(encoded) = args.first() else {
        bail!("usage: omnisync checkpoint <encoded>");
    };
    let checkpoint = Checkpoint::decode(encoded)?;
    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    if let Some(time) = chrono::DateTime::from_timestamp(checkpoint.block_timestamp as i64, 0) {
        println!("block time: {}", time.to_rfc3339());
    }
    Ok(())
}

async fn cmd_demo() -> Result<()> {
    const TOKEN: &str = "0x00000000000000000000000000000000000000aa";
    const TRANSFER: &str = "0xddf252ad";
    let transfer = || vec![EmittedLog::new(TOKEN).topic(TRANSFER)];

    let mainnet = Arc::new(InMemoryChain::new(1));
    let optimism = Arc::new(InMemoryChain::with_timing(10, 1_700_000_000, 2));
    for _ in 0..20 {
        mainnet.mine(transfer());
    }
    for _ in 0..100 {
        optimism.mine(transfer());
    }

    let (consumer, mut rx) = ChannelConsumer::new();
    let sync = SyncBuilder::new()
        .network(
            NetworkConfig::new("mainnet", 1).finality_block_count(4).poll_interval_ms(50),
            mainnet.clone(),
        )
        .network(
            NetworkConfig::new("optimism", 10).finality_block_count(10).poll_interval_ms(50),
            optimism.clone(),
        )
        .source(Source::new("mainnet-token", LogFilter::address(1, TOKEN).topic0(TRANSFER)))
        .source(Source::new("optimism-token", LogFilter::address(10, TOKEN).topic0(TRANSFER)))
        .events_query_size(25)
        .consumer(Arc::new(consumer))
        .build()
        .await?;

    println!("historical:");
    let mut events = sync.historical_events()?;
    while let Some(batch) = events.next_batch().await? {
        println!("  {} events up to {}", batch.events.len(), batch.checkpoint);
    }

    sync.start_realtime().await?;
    println!("realtime:");
    for _ in 0..3 {
        mainnet.mine(transfer());
        for _ in 0..6 {
            optimism.mine(transfer());
        }
    }
    mainnet.reorg(21);
    mainnet.mine(transfer());
    mainnet.mine(transfer());

    let deadline = tokio::time::sleep(Duration::from_secs(2));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            message = rx.recv() => match message {
                Some(ConsumerMessage::Event(RealtimeEvent::Block { checkpoint, events, .. })) => {
                    println!("  block     {checkpoint}  {} events", events.len());
                }
                Some(ConsumerMessage::Event(RealtimeEvent::Reorg { checkpoint })) => {
                    println!("  reorg     {checkpoint}");
                }
                Some(ConsumerMessage::Event(RealtimeEvent::Finalize { checkpoint })) => {
                    println!("  finalize  {checkpoint}");
                }
                Some(ConsumerMessage::Fatal(e)) => bail!(e),
                None => break,
            },
        }
    }

    for (network, status) in sync.status() {
        let block = status.block.map_or(0, |b| b.number);
        println!("{network}: block {block}, ready {}", status.ready);
    }
    sync.kill().await;
    Ok(())
}
