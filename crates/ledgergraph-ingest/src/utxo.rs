//! Bounded UTXO cache with random-batch eviction and a crash-recovery log.
//!
//! The cache maps outpoints to the address and value of the unspent output
//! so that spending inputs resolve without a node round-trip. Lookups are
//! destructive: an outpoint can be spent at most once, so `take` removes
//! the entry. The cache is bounded; once it reaches capacity a batch of
//! random entries is evicted. Evicted or never-cached outpoints simply fall
//! back to the node.
//!
//! Every insertion is appended to a recovery log so a restarted run warms
//! the cache instead of hammering the node. The log is append-only;
//! replaying it can resurrect already-spent outpoints, which costs nothing
//! beyond memory since stale entries are evicted or ignored.

use crate::buffer::{BufferedWriter, WriterTarget};
use crate::config::{CacheOptions, WriterOptions};
use crate::error::{Error, Result};
use dashmap::DashMap;
use ledgergraph_core::Amount;
use parking_lot::Mutex;
use rand::seq::index;
use rand::{thread_rng, Rng};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LOG_FILE: &str = "utxo.tsv";
const LOG_HEADER: &str = "txid\tvout\taddress\tvalue";

/// A reference to a transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: impl Into<String>, vout: u32) -> Self {
        Self {
            txid: txid.into(),
            vout,
        }
    }
}

/// What an unspent output pays, and to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub address: String,
    pub value: Amount,
}

/// One recovery-log record: an outpoint and its entry.
#[derive(Debug, Clone)]
pub struct UtxoRecord {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

impl UtxoRecord {
    fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}",
            self.outpoint.txid, self.outpoint.vout, self.entry.address, self.entry.value
        )
    }

    fn parse(line: &str) -> Result<Self> {
        let mut fields = line.split('\t');
        let (txid, vout, address, value) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(t), Some(v), Some(a), Some(val)) => (t, v, a, val),
            _ => {
                return Err(Error::Recovery(format!("malformed log line: {line:?}")));
            }
        };
        let vout: u32 = vout
            .parse()
            .map_err(|_| Error::Recovery(format!("bad vout in log line: {line:?}")))?;
        let value: Amount = value
            .parse()
            .map_err(|_| Error::Recovery(format!("bad value in log line: {line:?}")))?;
        Ok(UtxoRecord {
            outpoint: OutPoint::new(txid, vout),
            entry: UtxoEntry {
                address: address.to_string(),
                value,
            },
        })
    }
}

/// The bounded cache plus its recovery log.
pub struct UtxoCache {
    map: DashMap<OutPoint, UtxoEntry>,
    options: CacheOptions,
    /// Coarse lock serializing eviction batches.
    evict_lock: Mutex<()>,
    log: BufferedWriter<UtxoRecord>,
}

impl UtxoCache {
    /// Open the cache in `dir`, replaying any recovery log found there.
    pub fn open(
        dir: &Path,
        options: CacheOptions,
        writer_options: WriterOptions,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let log_path = dir.join(LOG_FILE);
        let map = DashMap::new();

        if log_path.exists() {
            let replayed = Self::replay(&log_path, &map, &options)?;
            info!(
                entries = replayed,
                path = %log_path.display(),
                "replayed UTXO recovery log"
            );
        }

        // The log must stay a single stable file so restarts find it.
        let log = BufferedWriter::new(
            "utxo-log",
            WriterTarget::Stable(log_path),
            Some(LOG_HEADER.to_string()),
            Box::new(|record: &UtxoRecord| Ok(record.to_line())),
            WriterOptions {
                max_records_per_file: None,
                ..writer_options
            },
            cancel,
        )?;

        Ok(Self {
            map,
            options,
            evict_lock: Mutex::new(()),
            log,
        })
    }

    /// Replay the log oldest-first; later lines win for duplicate
    /// outpoints. The log can outgrow the cache (it records every insert
    /// the run ever made), so replay evicts exactly as the live path does.
    fn replay(
        path: &PathBuf,
        map: &DashMap<OutPoint, UtxoEntry>,
        options: &CacheOptions,
    ) -> Result<usize> {
        let reader = BufReader::new(File::open(path)?);
        let mut replayed = 0usize;
        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if number == 0 && line == LOG_HEADER {
                continue;
            }
            if line.is_empty() {
                continue;
            }
            let record = UtxoRecord::parse(&line)?;
            while map.len() >= options.capacity {
                evict_random(map, options.squeeze);
            }
            map.insert(record.outpoint, record.entry);
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Insert an unspent output, evicting first if the cache is full. The
    /// insertion is appended to the recovery log.
    pub fn insert(&self, outpoint: OutPoint, entry: UtxoEntry) -> Result<()> {
        while self.map.len() >= self.options.capacity {
            self.evict_batch();
        }
        self.log.enqueue(UtxoRecord {
            outpoint: outpoint.clone(),
            entry: entry.clone(),
        })?;
        self.map.insert(outpoint, entry);
        Ok(())
    }

    /// Destructive lookup: the entry is removed if present. `None` means
    /// the caller must resolve the outpoint against the node.
    pub fn take(&self, outpoint: &OutPoint) -> Option<UtxoEntry> {
        self.map.remove(outpoint).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Whether the cache could shut down without losing queued log records.
    pub fn can_close(&self) -> bool {
        self.log.can_close()
    }

    /// Drain the recovery log and stop.
    pub fn close(self) -> Result<()> {
        self.log.close()
    }

    /// Evict one batch of randomly chosen entries.
    fn evict_batch(&self) {
        let _guard = self.evict_lock.lock();
        if self.map.len() < self.options.capacity {
            // Another thread already squeezed the map.
            return;
        }
        let requested = self.options.squeeze;
        let evicted = evict_random(&self.map, requested);
        debug!(evicted, remaining = self.map.len(), "evicted UTXO batch");
        if evicted < requested {
            warn!(
                requested, evicted,
                "eviction batch fell short; entries vanished concurrently"
            );
        }
    }
}

/// Remove up to `batch` randomly chosen entries, returning how many were
/// actually removed.
///
/// Keys are snapshotted outside the map's shards; an entry spent (and thus
/// removed) between the snapshot and the eviction draws a bounded number of
/// replacements rather than failing.
fn evict_random(map: &DashMap<OutPoint, UtxoEntry>, batch: usize) -> usize {
    let keys: Vec<OutPoint> = map.iter().map(|kv| kv.key().clone()).collect();
    if keys.is_empty() {
        return 0;
    }
    let batch = batch.min(keys.len());
    let mut rng = thread_rng();
    let mut drawn: Vec<usize> = index::sample(&mut rng, keys.len(), batch).into_vec();
    let mut redraws_left = batch;
    let mut evicted = 0usize;

    while let Some(i) = drawn.pop() {
        if map.remove(&keys[i]).is_some() {
            evicted += 1;
        } else if redraws_left > 0 {
            redraws_left -= 1;
            drawn.push(rng.gen_range(0..keys.len()));
        }
    }
    evicted
}
