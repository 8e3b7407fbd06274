//! Ledger block ingestion pipeline.
//!
//! This crate turns a node's block stream into durable value-flow graph
//! files.
//!
//! # Modules
//!
//! - [`client`] - REST client for the node, under the resilience policy
//! - [`resilience`] - retry, circuit breaker, and timeout composition
//! - [`utxo`] - bounded UTXO cache with a crash-recovery log
//! - [`buffer`] - generic durable buffered writer
//! - [`orchestrator`] - bounded-concurrency block loop with watermark
//!   resumption
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │ LedgerClient │  REST fetches under retry + breaker + timeout
//! └──────┬───────┘
//!        │
//!        ▼
//! ┌──────────────┐
//! │ Orchestrator │  semaphore-bounded heights, watermark progress
//! └──────┬───────┘
//!        │ resolves inputs via
//!        ▼
//! ┌──────────────┐
//! │  UtxoCache   │  destructive lookups, random-batch eviction
//! └──────┬───────┘
//!        │ edges + stats + recovery records
//!        ▼
//! ┌──────────────┐
//! │BufferedWriter│  one consumer thread per output, rotation
//! └──────────────┘
//! ```
//!
//! The graph TSV files are the product; everything else (recovery log,
//! address map, status file) exists so a restarted run picks up where the
//! last one stopped.

pub mod address_map;
pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod resilience;
pub mod utxo;

pub use error::{Error, Result};

pub use address_map::AddressIdMap;
pub use buffer::{BufferedWriter, Serializer, WriterTarget};
pub use client::LedgerClient;
pub use config::{CacheOptions, IngestConfig, ResilienceOptions, WriterOptions};
pub use orchestrator::{EdgeRow, IngestStatus, Orchestrator, RunSummary, Watermark};
pub use resilience::{CircuitBreaker, ResiliencePolicy};
pub use utxo::{OutPoint, UtxoCache, UtxoEntry, UtxoRecord};
