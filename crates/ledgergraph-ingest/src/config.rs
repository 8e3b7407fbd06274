//! Configuration for the ingestion pipeline.
//!
//! Every knob has a production default; [`IngestConfig::validate`] rejects
//! inconsistent settings before any worker starts.

use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Resilience parameters for calls against the node.
///
/// Layered outermost-in as retry, then circuit breaker, then per-attempt
/// timeout: each retry attempt consults the breaker, and the breaker samples
/// timed-out attempts as failures.
#[derive(Debug, Clone)]
pub struct ResilienceOptions {
    /// Deadline for a single attempt.
    pub timeout: Duration,

    /// Retries after the first attempt.
    pub retry_count: u32,

    /// Median delay before the first retry; later delays grow from it with
    /// decorrelated jitter.
    pub median_first_retry_delay: Duration,

    /// Rolling window over which the breaker samples outcomes.
    pub sampling_duration: Duration,

    /// Failure rate within the window that opens the breaker, in (0, 1].
    pub failure_threshold: f64,

    /// Minimum calls within the window before the rate is meaningful.
    /// Must be at least 2.
    pub minimum_throughput: u32,

    /// How long the breaker stays open before probing again.
    pub break_duration: Duration,
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            retry_count: 5,
            median_first_retry_delay: Duration::from_secs(15),
            sampling_duration: Duration::from_secs(2 * 60),
            failure_threshold: 0.5,
            minimum_throughput: 2,
            break_duration: Duration::from_secs(60),
        }
    }
}

impl ResilienceOptions {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold <= 0.0 || self.failure_threshold > 1.0 {
            return Err(Error::Config(format!(
                "failure_threshold must be in (0, 1], got {}",
                self.failure_threshold
            )));
        }
        if self.minimum_throughput < 2 {
            return Err(Error::Config(format!(
                "minimum_throughput must be at least 2, got {}",
                self.minimum_throughput
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config("timeout must be non-zero".to_string()));
        }
        if self.sampling_duration.is_zero() || self.break_duration.is_zero() {
            return Err(Error::Config(
                "sampling_duration and break_duration must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bounded UTXO cache parameters.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Entry count at which eviction kicks in.
    pub capacity: usize,

    /// Entries evicted per squeeze once capacity is reached.
    pub squeeze: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 1_000_000,
            squeeze: 1_000,
        }
    }
}

/// Durable writer parameters shared by the graph and statistics outputs.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Records per output file before rotating. `None` disables rotation
    /// (one stable file, as the recovery log requires).
    pub max_records_per_file: Option<usize>,

    /// Drain-poll interval while closing.
    pub close_poll_interval: Duration,

    /// Polls tolerated with records still pending after cancellation
    /// before the writer gives up waiting.
    pub close_grace_polls: u32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            max_records_per_file: Some(1_000_000),
            close_poll_interval: Duration::from_millis(500),
            close_grace_polls: 3,
        }
    }
}

/// Top-level configuration for one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Base URL of the node's REST interface.
    pub node_url: String,

    /// Chain the node must be following ("main" in production).
    pub chain: String,

    /// Directory for graph, statistics, recovery-log, and status files.
    pub output_dir: PathBuf,

    /// First height to ingest. Superseded by a persisted watermark when one
    /// is found in `output_dir`.
    pub from_height: u64,

    /// First height NOT to ingest: the range is `[from, to)`. `None` means
    /// one past the chain head at startup.
    pub to_height: Option<u64>,

    /// Blocks processed concurrently.
    pub concurrency: usize,

    /// Policy for raw calls against the node.
    pub transport_resilience: ResilienceOptions,

    /// Policy for whole-block fetch-and-build attempts; independent of the
    /// transport policy so a flaky block retries without re-opening the
    /// transport circuit.
    pub block_resilience: ResilienceOptions,

    pub cache: CacheOptions,
    pub writer: WriterOptions,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            node_url: "http://127.0.0.1:8332".to_string(),
            chain: "main".to_string(),
            output_dir: PathBuf::from("./ledgergraph"),
            from_height: 0,
            to_height: None,
            concurrency: num_cpus::get(),
            transport_resilience: ResilienceOptions::default(),
            block_resilience: ResilienceOptions::default(),
            cache: CacheOptions::default(),
            writer: WriterOptions::default(),
        }
    }
}

impl IngestConfig {
    /// Reject inconsistent settings before anything starts.
    pub fn validate(&self) -> Result<()> {
        if self.node_url.is_empty() {
            return Err(Error::Config("node_url must not be empty".to_string()));
        }
        if self.chain.is_empty() {
            return Err(Error::Config("chain must not be empty".to_string()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if let Some(to) = self.to_height {
            if to <= self.from_height {
                return Err(Error::Config(format!(
                    "to_height {} must exceed from_height {}",
                    to, self.from_height
                )));
            }
        }
        if self.cache.squeeze == 0 {
            return Err(Error::Config("cache squeeze must be at least 1".to_string()));
        }
        if self.cache.capacity <= self.cache.squeeze {
            return Err(Error::Config(format!(
                "cache capacity {} must exceed squeeze {}",
                self.cache.capacity, self.cache.squeeze
            )));
        }
        if let Some(max) = self.writer.max_records_per_file {
            if max == 0 {
                return Err(Error::Config(
                    "max_records_per_file must be at least 1 when set".to_string(),
                ));
            }
        }
        self.transport_resilience.validate()?;
        self.block_resilience.validate()
    }
}
