//! Ledger graph ingestion daemon.
//!
//! Walks a height range of the ledger through a node's REST interface and
//! writes per-block value-flow graphs, block statistics, and resumption
//! state to the output directory.
//!
//! # Usage
//!
//! ```bash
//! # Ingest from genesis to the current chain head
//! ledgergraph-ingest --node-url http://127.0.0.1:8332
//!
//! # Ingest a fixed range with custom concurrency
//! ledgergraph-ingest \
//!     --node-url http://node:8332 \
//!     --from-height 700000 --to-height 710000 \
//!     --concurrency 8 \
//!     --output-dir /data/ledgergraph
//! ```
//!
//! # Graceful shutdown
//!
//! SIGINT (Ctrl+C) cancels the run: no further blocks are dispatched,
//! in-flight blocks finish or abandon, writers drain, and the status file
//! records the watermark so the next run resumes exactly where this one
//! stopped.

use anyhow::{Context, Result};
use clap::Parser;
use ledgergraph_ingest::{
    IngestConfig, LedgerClient, Orchestrator, ResilienceOptions, ResiliencePolicy,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Ledger graph ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "ledgergraph-ingest")]
#[command(about = "Ledger block ingestion into value-flow graph files")]
#[command(version)]
struct Args {
    /// Base URL of the node's REST interface
    #[arg(long, default_value = "http://127.0.0.1:8332")]
    node_url: String,

    /// Chain the node must be following
    #[arg(long, default_value = "main")]
    chain: String,

    /// Output directory for graph, stats, and resumption files
    #[arg(long, short, default_value = "./ledgergraph")]
    output_dir: PathBuf,

    /// First height to ingest (a status file in the output directory wins)
    #[arg(long, default_value = "0")]
    from_height: u64,

    /// First height NOT to ingest; defaults to one past the chain head
    #[arg(long)]
    to_height: Option<u64>,

    /// Blocks processed concurrently (0 = number of CPUs)
    #[arg(long, default_value = "0")]
    concurrency: usize,

    /// UTXO cache capacity in entries
    #[arg(long, default_value = "1000000")]
    cache_capacity: usize,

    /// Entries evicted per squeeze when the cache is full
    #[arg(long, default_value = "1000")]
    cache_squeeze: usize,

    /// Graph records per output file before rotating
    #[arg(long, default_value = "1000000")]
    records_per_file: usize,

    /// Per-attempt timeout for node calls, in seconds
    #[arg(long, default_value = "600")]
    request_timeout_secs: u64,

    /// Retries after the first failed attempt
    #[arg(long, default_value = "5")]
    retry_count: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap())
                .add_directive("ledgergraph_ingest=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args);
    config
        .validate()
        .context("invalid configuration")?;

    tracing::info!("Ledger graph ingestion starting...");
    tracing::info!("  Node:        {}", config.node_url);
    tracing::info!("  Chain:       {}", config.chain);
    tracing::info!("  Output:      {}", config.output_dir.display());
    tracing::info!("  Heights:     {}..{:?}", config.from_height, config.to_height);
    tracing::info!("  Concurrency: {}", config.concurrency);

    // One token cancels everything: Ctrl+C, writer failures, fatal errors.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received, stopping gracefully...");
            signal_cancel.cancel();
        }
    });

    let transport_policy =
        ResiliencePolicy::new(config.transport_resilience.clone(), cancel.clone());
    let block_policy = ResiliencePolicy::new(config.block_resilience.clone(), cancel.clone());
    let client = LedgerClient::new(&config.node_url, transport_policy)
        .context("failed to build node client")?;

    let orchestrator = Orchestrator::new(config, client, block_policy, cancel)
        .context("failed to initialize pipeline")?;

    let summary = match orchestrator.run().await {
        Ok(summary) => summary,
        Err(ledgergraph_ingest::Error::Cancelled) => {
            tracing::info!("Run cancelled; resumption state persisted");
            return Ok(());
        }
        Err(e) => return Err(e).context("ingestion failed"),
    };

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("INGESTION COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Blocks completed: {}", summary.completed_blocks);
    tracing::info!("Blocks failed:    {}", summary.failed_blocks);
    tracing::info!("Edges written:    {}", summary.edges_written);

    Ok(())
}

fn build_config(args: &Args) -> IngestConfig {
    let resilience = ResilienceOptions {
        timeout: Duration::from_secs(args.request_timeout_secs),
        retry_count: args.retry_count,
        ..Default::default()
    };
    IngestConfig {
        node_url: args.node_url.clone(),
        chain: args.chain.clone(),
        output_dir: args.output_dir.clone(),
        from_height: args.from_height,
        to_height: args.to_height,
        concurrency: if args.concurrency == 0 {
            num_cpus::get()
        } else {
            args.concurrency
        },
        transport_resilience: resilience.clone(),
        block_resilience: resilience,
        cache: ledgergraph_ingest::CacheOptions {
            capacity: args.cache_capacity,
            squeeze: args.cache_squeeze,
        },
        writer: ledgergraph_ingest::WriterOptions {
            max_records_per_file: Some(args.records_per_file),
            ..Default::default()
        },
    }
}
