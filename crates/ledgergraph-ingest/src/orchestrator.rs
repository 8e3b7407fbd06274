//! Block orchestrator: bounded-concurrency ingestion with watermark
//! resumption.
//!
//! Heights are dispatched in order but complete in whatever order the node
//! and the graph builder allow. The [`Watermark`] keeps the truth: the
//! frontier is the lowest height not yet completed, and completions above
//! it are tracked explicitly rather than collapsed into a "last finished"
//! number that would paper over gaps. A restarted run resumes at the
//! frontier and skips the heights already completed above it.
//!
//! Per-block failures are contained here: logged with height and cause,
//! left incomplete for the next run, never fatal to sibling blocks. Writer
//! failures cancel the whole run through the shared token.

use crate::address_map::AddressIdMap;
use crate::buffer::{BufferedWriter, WriterTarget};
use crate::client::LedgerClient;
use crate::config::IngestConfig;
use crate::error::{Error, Result};
use crate::resilience::ResiliencePolicy;
use crate::utxo::{OutPoint, UtxoCache, UtxoEntry};
use chrono::{DateTime, Utc};
use ledgergraph_core::{Block, BlockGraph, BlockStatistics, Edge, Transaction, TransactionGraph};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STATUS_FILE: &str = "status.json";
const ADDRESS_FILE: &str = "addresses.tsv";
const STATS_FILE: &str = "blocks_stats.tsv";

/// Progress tracking over out-of-order block completion.
///
/// `frontier` is the lowest height not yet completed; everything below it
/// is done. Completions above the frontier are held until the gap closes.
#[derive(Debug)]
pub struct Watermark {
    frontier: u64,
    in_flight: BTreeSet<u64>,
    completed: BTreeSet<u64>,
}

impl Watermark {
    pub fn new(start: u64) -> Self {
        Self {
            frontier: start,
            in_flight: BTreeSet::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Rebuild from a persisted status: frontier plus completions above it.
    pub fn restore(frontier: u64, completed: impl IntoIterator<Item = u64>) -> Self {
        let mut mark = Self::new(frontier);
        mark.completed.extend(
            completed
                .into_iter()
                .filter(|height| *height >= frontier),
        );
        mark.advance();
        mark
    }

    pub fn start(&mut self, height: u64) {
        self.in_flight.insert(height);
    }

    pub fn complete(&mut self, height: u64) {
        self.in_flight.remove(&height);
        if height >= self.frontier {
            self.completed.insert(height);
            self.advance();
        }
    }

    /// A failed height stops being in flight but never completes.
    pub fn abandon(&mut self, height: u64) {
        self.in_flight.remove(&height);
    }

    fn advance(&mut self) {
        while self.completed.remove(&self.frontier) {
            self.frontier += 1;
        }
    }

    /// The lowest height not yet completed; where a restart resumes.
    pub fn frontier(&self) -> u64 {
        self.frontier
    }

    pub fn is_complete(&self, height: u64) -> bool {
        height < self.frontier || self.completed.contains(&height)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Completed heights still stranded above the frontier.
    pub fn completed_above_frontier(&self) -> Vec<u64> {
        self.completed.iter().copied().collect()
    }
}

/// Persisted resumption state.
#[derive(Debug, Serialize, Deserialize)]
pub struct IngestStatus {
    pub chain: String,
    /// Lowest height not yet completed.
    pub frontier: u64,
    /// Completed heights above the frontier.
    pub completed: Vec<u64>,
    pub updated_at: DateTime<Utc>,
}

impl IngestStatus {
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Atomic write: temp file, then rename over the live one.
    pub fn persist(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// One graph edge as written to the graph TSV, tagged with its height.
#[derive(Debug, Clone)]
pub struct EdgeRow {
    pub height: u64,
    pub edge: Edge,
}

impl EdgeRow {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}",
            self.height,
            self.edge.source,
            self.edge.target,
            self.edge.value,
            self.edge.kind.as_str()
        )
    }
}

const EDGE_HEADER: &str = "height\tsource\ttarget\tvalue\tkind";

/// Outcome of one orchestrator run.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub completed_blocks: u64,
    pub failed_blocks: u64,
    pub edges_written: u64,
}

struct Ctx {
    config: IngestConfig,
    client: LedgerClient,
    block_policy: ResiliencePolicy,
    cache: UtxoCache,
    addresses: AddressIdMap,
    graph_writer: BufferedWriter<EdgeRow>,
    stats_writer: BufferedWriter<BlockStatistics>,
    watermark: Mutex<Watermark>,
    status_path: PathBuf,
    /// Serializes status snapshots and their write+rename; concurrent
    /// completions would otherwise race on the temp file.
    status_lock: Mutex<()>,
    cancel: CancellationToken,
}

/// Drives ingestion over a height range.
pub struct Orchestrator {
    ctx: Arc<Ctx>,
}

impl Orchestrator {
    /// Wire up the cache, writers, and watermark. A status file found in
    /// the output directory supersedes `from_height`.
    pub fn new(
        config: IngestConfig,
        client: LedgerClient,
        block_policy: ResiliencePolicy,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.output_dir)?;

        let status_path = config.output_dir.join(STATUS_FILE);
        let watermark = match IngestStatus::load(&status_path)? {
            Some(status) => {
                if status.chain != config.chain {
                    return Err(Error::Config(format!(
                        "status file belongs to chain `{}`, configured chain is `{}`",
                        status.chain, config.chain
                    )));
                }
                info!(
                    frontier = status.frontier,
                    stranded = status.completed.len(),
                    "resuming from status file"
                );
                Watermark::restore(status.frontier.max(config.from_height), status.completed)
            }
            None => Watermark::new(config.from_height),
        };

        let cache = UtxoCache::open(
            &config.output_dir,
            config.cache.clone(),
            config.writer.clone(),
            cancel.clone(),
        )?;
        let addresses = AddressIdMap::open(config.output_dir.join(ADDRESS_FILE))?;

        let graph_writer = BufferedWriter::new(
            "graph",
            WriterTarget::Rotating {
                dir: config.output_dir.clone(),
                prefix: "graph".to_string(),
                extension: "tsv".to_string(),
            },
            Some(EDGE_HEADER.to_string()),
            Box::new(|row: &EdgeRow| Ok(row.to_line())),
            config.writer.clone(),
            cancel.clone(),
        )?;
        let stats_writer = BufferedWriter::new(
            "stats",
            WriterTarget::Stable(config.output_dir.join(STATS_FILE)),
            Some(BlockStatistics::header().to_string()),
            Box::new(|stats: &BlockStatistics| Ok(stats.to_line())),
            config.writer.clone(),
            cancel.clone(),
        )?;

        Ok(Self {
            ctx: Arc::new(Ctx {
                config,
                client,
                block_policy,
                cache,
                addresses,
                graph_writer,
                stats_writer,
                watermark: Mutex::new(watermark),
                status_path,
                status_lock: Mutex::new(()),
                cancel,
            }),
        })
    }

    /// Ingest `[frontier, to)` and shut everything down in order.
    pub async fn run(self) -> Result<RunSummary> {
        let ctx = Arc::clone(&self.ctx);

        let info = ctx
            .client
            .assert_chain(&ctx.config.chain)
            .await
            .map_err(Error::after_retries)?;

        let start = ctx.watermark.lock().frontier();
        let end = match ctx.config.to_height {
            Some(to) => {
                if to > info.blocks + 1 {
                    return Err(Error::InvalidHeight {
                        height: to,
                        head: info.blocks,
                    });
                }
                to
            }
            None => info.blocks + 1,
        };
        if start >= end {
            info!(start, end, "nothing to ingest");
            return self.shutdown(RunSummary::default()).await;
        }
        info!(start, end, concurrency = ctx.config.concurrency, "ingesting blocks");

        let semaphore = Arc::new(Semaphore::new(ctx.config.concurrency));
        let mut tasks: JoinSet<Option<u64>> = JoinSet::new();
        let mut summary = RunSummary::default();

        for height in start..end {
            if ctx.cancel.is_cancelled() {
                warn!(height, "cancellation requested, not dispatching further blocks");
                break;
            }
            if ctx.watermark.lock().is_complete(height) {
                debug!(height, "already completed in a previous run");
                continue;
            }

            let permit = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|_| Error::Cancelled)?
                }
            };

            ctx.watermark.lock().start(height);
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move {
                let outcome = ctx.ingest_block(height).await;
                // The permit is held until the block's records are accepted
                // by the writers; after that, loss requires a failed run.
                drop(permit);
                match outcome {
                    Ok(edges) => {
                        ctx.complete(height, edges);
                        Some(edges)
                    }
                    Err(e) if e.is_cancellation() => {
                        ctx.watermark.lock().abandon(height);
                        None
                    }
                    Err(e) => {
                        error!(height, error = %e, "block failed; leaving for the next run");
                        ctx.watermark.lock().abandon(height);
                        None
                    }
                }
            });

            // Reap finished tasks without blocking the dispatch loop.
            while let Some(done) = tasks.try_join_next() {
                tally(&mut summary, done);
            }
        }

        while let Some(done) = tasks.join_next().await {
            tally(&mut summary, done);
        }

        self.shutdown(summary).await
    }

    /// Persist maps and status, then drain and close the writers.
    async fn shutdown(self, summary: RunSummary) -> Result<RunSummary> {
        let ctx = match Arc::into_inner(self.ctx) {
            Some(ctx) => ctx,
            None => {
                // All tasks joined before shutdown; this is unreachable in
                // practice but must not panic the run.
                return Err(Error::Config(
                    "orchestrator context still shared at shutdown".to_string(),
                ));
            }
        };

        ctx.addresses.persist()?;
        ctx.persist_status()?;

        let cancelled = ctx.cancel.is_cancelled();
        tokio::task::spawn_blocking(move || -> Result<()> {
            ctx.graph_writer.close()?;
            ctx.stats_writer.close()?;
            ctx.cache.close()?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Config(format!("shutdown task failed: {e}")))??;

        if cancelled {
            info!(?summary, "run cancelled; progress persisted");
            Err(Error::Cancelled)
        } else {
            info!(?summary, "run complete");
            Ok(summary)
        }
    }
}

fn tally(summary: &mut RunSummary, done: std::result::Result<Option<u64>, tokio::task::JoinError>) {
    match done {
        Ok(Some(edges)) => {
            summary.completed_blocks += 1;
            summary.edges_written += edges;
        }
        Ok(None) => summary.failed_blocks += 1,
        Err(e) => {
            error!(error = %e, "block task panicked");
            summary.failed_blocks += 1;
        }
    }
}

impl Ctx {
    /// Fetch, build, and enqueue one block under the block-level policy.
    async fn ingest_block(&self, height: u64) -> Result<u64> {
        let graph = self
            .block_policy
            .execute(|| {
                let ctx = self;
                async move {
                    let hash = ctx.client.block_hash(height).await?;
                    let block = ctx.client.block(&hash).await?;
                    ctx.build_graph(&block).await
                }
            })
            .await
            .map_err(Error::after_retries)?;

        let edges = graph.edge_count() as u64;
        debug!(
            height,
            edges,
            nodes = graph.node_count(),
            "built block graph"
        );

        for edge in graph.edges() {
            self.graph_writer.enqueue(EdgeRow {
                height,
                edge: edge.clone(),
            })?;
        }
        // Stats row goes last so a stats line implies its edges were
        // accepted too.
        self.stats_writer.enqueue(graph.stats)?;
        Ok(edges)
    }

    /// Resolve inputs through the cache (falling back to the node), build
    /// per-transaction graphs, and register outputs for later spends.
    ///
    /// Transactions are processed in block order: within a block an output
    /// must be created before a later transaction can spend it.
    async fn build_graph(&self, block: &Block) -> Result<BlockGraph> {
        let started = Instant::now();
        let mut graph = BlockGraph::new(block.height, block.hash.clone());

        for tx in &block.transactions {
            let tg = if tx.is_coinbase() {
                let mut tg = TransactionGraph::coinbase(tx.txid.clone());
                self.register_outputs(tx, &mut tg)?;
                tg
            } else {
                let mut tg = TransactionGraph::new(tx.txid.clone());
                for input in &tx.inputs {
                    let (txid, vout) = match input.outpoint() {
                        Some(outpoint) => outpoint,
                        None => continue,
                    };
                    if let Some(entry) = self.resolve_input(txid, vout).await? {
                        tg.add_source(entry.address, entry.value);
                    }
                }
                self.register_outputs(tx, &mut tg)?;
                tg
            };

            for edge in tg.into_edges()? {
                self.addresses.id_of(&edge.source);
                self.addresses.id_of(&edge.target);
                graph.add_edge(edge);
            }
        }

        graph.stats.transactions = block.transactions.len();
        graph.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(graph)
    }

    /// Add a transaction's value-bearing outputs as graph targets and cache
    /// them for later spends.
    ///
    /// Outputs the node reports without an address (raw pay-to-pubkey in
    /// early blocks) are skipped, not fatal.
    fn register_outputs(&self, tx: &Transaction, tg: &mut TransactionGraph) -> Result<()> {
        for output in &tx.outputs {
            let kind = output.script_kind(&tx.txid)?;
            if !kind.transfers_value() || output.value.is_zero() {
                continue;
            }
            let address = match output.address() {
                Some(address) => address,
                None => {
                    debug!(txid = %tx.txid, vout = output.index, "output has no address, skipping");
                    continue;
                }
            };
            tg.add_target(address, output.value);
            self.cache.insert(
                OutPoint::new(tx.txid.clone(), output.index),
                UtxoEntry {
                    address: address.to_string(),
                    value: output.value,
                },
            )?;
        }
        Ok(())
    }

    /// The address and value behind a spent outpoint: cache hit, or a
    /// transaction fetch from the node.
    ///
    /// `None` means the spent output exists but has no address; the input
    /// cannot contribute a source node and is skipped.
    async fn resolve_input(&self, txid: &str, vout: u32) -> Result<Option<UtxoEntry>> {
        let outpoint = OutPoint::new(txid, vout);
        if let Some(entry) = self.cache.take(&outpoint) {
            return Ok(Some(entry));
        }
        debug!(txid, vout, "cache miss, fetching source transaction");
        let tx = self.client.transaction(txid).await?;
        let output = tx
            .outputs
            .iter()
            .find(|o| o.index == vout)
            .ok_or_else(|| Error::MissingOutput {
                txid: txid.to_string(),
                vout,
            })?;
        match output.address() {
            Some(address) => Ok(Some(UtxoEntry {
                address: address.to_string(),
                value: output.value,
            })),
            None => {
                debug!(txid, vout, "spent output has no address, skipping input");
                Ok(None)
            }
        }
    }

    fn complete(&self, height: u64, edges: u64) {
        let mut mark = self.watermark.lock();
        mark.complete(height);
        debug!(
            height,
            edges,
            frontier = mark.frontier(),
            in_flight = mark.in_flight(),
            "block completed"
        );
        drop(mark);
        if let Err(e) = self.persist_status() {
            error!(error = %e, "failed to persist status; cancelling the run");
            self.cancel.cancel();
        }
    }

    fn persist_status(&self) -> Result<()> {
        // Snapshot and write under one guard: the file on disk always
        // reflects the newest snapshot taken, in order.
        let _guard = self.status_lock.lock();
        let mark = self.watermark.lock();
        let status = IngestStatus {
            chain: self.config.chain.clone(),
            frontier: mark.frontier(),
            completed: mark.completed_above_frontier(),
            updated_at: Utc::now(),
        };
        drop(mark);
        status.persist(&self.status_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResilienceOptions;
    use ledgergraph_core::{Amount, EdgeKind};
    use tempfile::TempDir;

    #[test]
    fn test_watermark_tracks_lowest_incomplete() {
        let mut mark = Watermark::new(10);
        mark.start(10);
        mark.start(11);
        mark.start(12);

        // Out-of-order completion does not move the frontier past a gap.
        mark.complete(12);
        assert_eq!(mark.frontier(), 10);
        mark.complete(10);
        assert_eq!(mark.frontier(), 11);
        assert_eq!(mark.completed_above_frontier(), vec![12]);

        mark.complete(11);
        assert_eq!(mark.frontier(), 13);
        assert!(mark.completed_above_frontier().is_empty());
        assert_eq!(mark.in_flight(), 0);
    }

    #[test]
    fn test_watermark_failed_height_stays_incomplete() {
        let mut mark = Watermark::new(0);
        mark.start(0);
        mark.start(1);
        mark.complete(1);
        mark.abandon(0);

        assert_eq!(mark.frontier(), 0);
        assert!(!mark.is_complete(0));
        assert!(mark.is_complete(1));
    }

    #[test]
    fn test_watermark_restore_skips_stranded_completions() {
        let mark = Watermark::restore(5, vec![7, 9]);
        assert_eq!(mark.frontier(), 5);
        assert!(mark.is_complete(7));
        assert!(!mark.is_complete(6));
        // Heights below the frontier are complete by definition.
        assert!(mark.is_complete(3));
    }

    #[test]
    fn test_status_file_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(STATUS_FILE);

        let status = IngestStatus {
            chain: "main".to_string(),
            frontier: 42,
            completed: vec![44, 47],
            updated_at: Utc::now(),
        };
        status.persist(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = IngestStatus::load(&path).unwrap().unwrap();
        assert_eq!(loaded.frontier, 42);
        assert_eq!(loaded.completed, vec![44, 47]);
        assert_eq!(loaded.chain, "main");
    }

    #[test]
    fn test_missing_status_file_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(IngestStatus::load(&tmp.path().join(STATUS_FILE))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_edge_row_line_format() {
        let row = EdgeRow {
            height: 800_000,
            edge: Edge::new("S", "A", Amount::from_coins(4.9999), EdgeKind::Transfer),
        };
        assert_eq!(row.to_line(), "800000\tS\tA\t4.99990000\tTransfer");
        assert_eq!(
            row.to_line().split('\t').count(),
            EDGE_HEADER.split('\t').count()
        );
    }

    fn test_ctx(tmp: &TempDir) -> Ctx {
        test_ctx_with(tmp, ResilienceOptions::default())
    }

    fn test_ctx_with(tmp: &TempDir, resilience: ResilienceOptions) -> Ctx {
        let cancel = CancellationToken::new();
        let config = IngestConfig {
            output_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let policy = ResiliencePolicy::new(resilience, cancel.clone());
        let client = LedgerClient::new("http://127.0.0.1:1", policy.clone()).unwrap();

        let cache = UtxoCache::open(
            tmp.path(),
            config.cache.clone(),
            config.writer.clone(),
            cancel.clone(),
        )
        .unwrap();
        let addresses = AddressIdMap::open(tmp.path().join(ADDRESS_FILE)).unwrap();
        let graph_writer = BufferedWriter::new(
            "graph",
            WriterTarget::Rotating {
                dir: tmp.path().to_path_buf(),
                prefix: "graph".to_string(),
                extension: "tsv".to_string(),
            },
            Some(EDGE_HEADER.to_string()),
            Box::new(|row: &EdgeRow| Ok(row.to_line())),
            config.writer.clone(),
            cancel.clone(),
        )
        .unwrap();
        let stats_writer = BufferedWriter::new(
            "stats",
            WriterTarget::Stable(tmp.path().join(STATS_FILE)),
            Some(BlockStatistics::header().to_string()),
            Box::new(|stats: &BlockStatistics| Ok(stats.to_line())),
            config.writer.clone(),
            cancel.clone(),
        )
        .unwrap();

        Ctx {
            config,
            client,
            block_policy: policy,
            cache,
            addresses,
            graph_writer,
            stats_writer,
            watermark: Mutex::new(Watermark::new(0)),
            status_path: tmp.path().join(STATUS_FILE),
            status_lock: Mutex::new(()),
            cancel,
        }
    }

    fn block_json(height: u64, hash: &str, txs: &str) -> Block {
        serde_json::from_str(&format!(
            r#"{{"hash":"{hash}","height":{height},"tx":[{txs}]}}"#
        ))
        .unwrap()
    }

    const COINBASE_TX: &str = r#"{
        "txid":"cb0",
        "vin":[{"coinbase":"04ffff001d"}],
        "vout":[
            {"value":6.25,"n":0,"scriptPubKey":{"address":"minerA","type":"pubkeyhash"}},
            {"value":0.0,"n":1,"scriptPubKey":{"type":"nulldata"}}
        ]
    }"#;

    #[tokio::test]
    async fn test_build_graph_for_coinbase_block() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_ctx(&tmp);

        let block = block_json(100, "h100", COINBASE_TX);
        let graph = ctx.build_graph(&block).await.unwrap();

        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.stats.generation_edges, 1);
        assert_eq!(graph.stats.generation_sum, Amount::from_coins(6.25));
        assert_eq!(graph.stats.transactions, 1);
        // The spendable output was cached; the nulldata one was not.
        assert_eq!(ctx.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_build_graph_spends_from_cache_within_block() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_ctx(&tmp);

        // cb0 funds minerA; the second transaction spends that output in
        // the same block, so resolution must see it without the node.
        let spend = r#"{
            "txid":"t1",
            "vin":[{"txid":"cb0","vout":0}],
            "vout":[
                {"value":6.2499,"n":0,"scriptPubKey":{"address":"B","type":"witness_v0_keyhash"}}
            ]
        }"#;
        let block = block_json(101, "h101", &format!("{COINBASE_TX},{spend}"));
        let graph = ctx.build_graph(&block).await.unwrap();

        assert_eq!(graph.stats.generation_edges, 1);
        assert_eq!(graph.stats.transfer_edges, 1);
        assert_eq!(graph.stats.fee_edges, 1);
        assert_eq!(graph.stats.fee_sum, Amount::from_coins(0.0001));
        // cb0:0 was spent destructively; only t1:0 remains cached.
        assert_eq!(ctx.cache.len(), 1);
        assert!(ctx
            .cache
            .take(&OutPoint::new("t1", 0))
            .is_some());
    }

    #[test]
    fn test_concurrent_completions_persist_status() {
        let tmp = TempDir::new().unwrap();
        let ctx = Arc::new(test_ctx(&tmp));

        let heights: u64 = 200;
        {
            let mut mark = ctx.watermark.lock();
            for height in 0..heights {
                mark.start(height);
            }
        }

        // Four workers completing interleaved heights; each completion
        // rewrites the status file.
        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let ctx = Arc::clone(&ctx);
                scope.spawn(move || {
                    for height in (worker..heights).step_by(4) {
                        ctx.complete(height, 0);
                    }
                });
            }
        });

        // No completion may fail its persist and cancel the run.
        assert!(!ctx.cancel.is_cancelled());
        let status = IngestStatus::load(&ctx.status_path).unwrap().unwrap();
        assert_eq!(status.frontier, heights);
        assert!(status.completed.is_empty());
    }

    #[tokio::test]
    async fn test_build_graph_skips_outputs_without_address() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_ctx(&tmp);

        // Early-style coinbase paying a raw pubkey: the node reports no
        // address for vout 0.
        let coinbase = r#"{
            "txid":"cb1",
            "vin":[{"coinbase":"04"}],
            "vout":[
                {"value":50.0,"n":0,"scriptPubKey":{"type":"pubkey"}},
                {"value":0.5,"n":1,"scriptPubKey":{"address":"minerB","type":"pubkeyhash"}}
            ]
        }"#;
        let block = block_json(5, "h5", coinbase);
        let graph = ctx.build_graph(&block).await.unwrap();

        // Only the addressed output becomes an edge and a cache entry.
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.stats.generation_sum, Amount::from_coins(0.5));
        assert_eq!(ctx.cache.len(), 1);
        assert!(ctx.cache.take(&OutPoint::new("cb1", 1)).is_some());
    }

    #[tokio::test]
    async fn test_unreachable_node_surfaces_as_inaccessible() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_ctx_with(
            &tmp,
            ResilienceOptions {
                retry_count: 0,
                median_first_retry_delay: std::time::Duration::from_millis(1),
                ..Default::default()
            },
        );

        // Nothing listens on the client's port; the transport failure must
        // come back classified, not raw.
        let err = ctx.ingest_block(1).await.unwrap_err();
        assert!(matches!(err, Error::NodeInaccessible(_)));
    }

    #[tokio::test]
    async fn test_build_graph_registers_address_ids() {
        let tmp = TempDir::new().unwrap();
        let ctx = test_ctx(&tmp);

        let block = block_json(100, "h100", COINBASE_TX);
        ctx.build_graph(&block).await.unwrap();

        // Both the synthetic source and the payout address get ids.
        assert_eq!(ctx.addresses.len(), 2);
    }
}
