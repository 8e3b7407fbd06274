//! Per-block weighted value-flow graph and the transaction graph builder.
//!
//! The builder is a pure function over a transaction's resolved inputs and
//! outputs: accumulate sources and targets, then [`TransactionGraph::into_edges`]
//! infers change and fee and emits weighted edges. Rounding to eight
//! fractional digits is applied at every arithmetic step (see
//! [`crate::amount`]); skipping the intermediate rounding produces values
//! that disagree with the ledger's own totals.

use crate::amount::Amount;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Synthetic source node for generation edges.
pub const COINBASE: &str = "Coinbase";

/// Synthetic target node for fee edges.
pub const MINER: &str = "Miner";

/// How value moved between two addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Newly created currency, from the coinbase transaction.
    Generation,
    /// An ordinary transfer between distinct addresses.
    Transfer,
    /// A transfer whose transaction had a change output folded back into
    /// its paying input.
    ChangeAdjustedTransfer,
    /// An input's contribution to the transaction fee.
    Fee,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Generation => "Generation",
            EdgeKind::Transfer => "Transfer",
            EdgeKind::ChangeAdjustedTransfer => "ChangeAdjustedTransfer",
            EdgeKind::Fee => "Fee",
        }
    }
}

/// A weighted, typed edge between two address nodes.
///
/// Edge values are always positive; zero-value edges are never emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub source: String,
    pub target: String,
    pub value: Amount,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        value: Amount,
        kind: EdgeKind,
    ) -> Self {
        Edge {
            source: source.into(),
            target: target.into(),
            value,
            kind,
        }
    }
}

/// Accumulates one transaction's resolved sources and targets, then emits
/// edges.
#[derive(Debug)]
pub struct TransactionGraph {
    txid: String,
    coinbase: bool,
    sources: BTreeMap<String, Amount>,
    targets: BTreeMap<String, Amount>,
}

impl TransactionGraph {
    pub fn new(txid: impl Into<String>) -> Self {
        TransactionGraph {
            txid: txid.into(),
            coinbase: false,
            sources: BTreeMap::new(),
            targets: BTreeMap::new(),
        }
    }

    /// A graph for a block's generation transaction: the only source is the
    /// synthetic coinbase node.
    pub fn coinbase(txid: impl Into<String>) -> Self {
        TransactionGraph {
            txid: txid.into(),
            coinbase: true,
            sources: BTreeMap::new(),
            targets: BTreeMap::new(),
        }
    }

    /// Register a resolved input. Repeated addresses accumulate.
    pub fn add_source(&mut self, address: impl Into<String>, value: Amount) {
        *self.sources.entry(address.into()).or_default() += value;
    }

    /// Register a value-bearing output. Repeated addresses accumulate.
    pub fn add_target(&mut self, address: impl Into<String>, value: Amount) {
        *self.targets.entry(address.into()).or_default() += value;
    }

    /// Infer change and fee and emit the transaction's edges.
    ///
    /// General case, in order: total the sides; fold at most one change
    /// output back into its paying input (two or more candidates is an
    /// unsupported shape, reported rather than guessed at); subtract the
    /// fee from every input's balance; split each output across the inputs
    /// in proportion to their post-fee balances; emit one fee edge per
    /// input.
    pub fn into_edges(self) -> Result<Vec<Edge>> {
        if self.coinbase {
            return Ok(self
                .targets
                .into_iter()
                .filter(|(_, value)| value.is_positive())
                .map(|(address, value)| {
                    Edge::new(COINBASE, address, value, EdgeKind::Generation)
                })
                .collect());
        }

        let mut sources = self.sources;
        let mut targets = self.targets;

        let mut total_in: Amount = sources.values().copied().sum();
        let total_out: Amount = targets.values().copied().sum();
        let fee = total_in - total_out;
        if fee.is_negative() {
            return Err(Error::NegativeFee {
                txid: self.txid,
                total_in: total_in.to_string(),
                total_out: total_out.to_string(),
            });
        }

        // An output paying back to an input address is a change candidate.
        let candidates: Vec<String> = targets
            .keys()
            .filter(|address| sources.contains_key(*address))
            .cloned()
            .collect();

        let transfer_kind = match candidates.len() {
            0 => EdgeKind::Transfer,
            1 => {
                let address = &candidates[0];
                let change = targets.remove(address).expect("candidate is a target");
                *sources.get_mut(address).expect("candidate is a source") -= change;
                // The returned change no longer competes for outgoing edges.
                total_in -= change;
                EdgeKind::ChangeAdjustedTransfer
            }
            n => {
                return Err(Error::UnsupportedTxShape {
                    txid: self.txid,
                    candidates: n,
                });
            }
        };

        // Fee is charged uniformly against every input's balance.
        for balance in sources.values_mut() {
            *balance -= fee;
        }
        let pool = total_in - fee;

        let mut edges = Vec::with_capacity(sources.len() * (targets.len() + 1));
        for (source, balance) in &sources {
            if let Some(share) = balance.ratio(pool) {
                for (target, value) in &targets {
                    let split = value.scale(share);
                    if split.is_positive() {
                        edges.push(Edge::new(source, target, split, transfer_kind));
                    }
                }
            }
            if fee.is_positive() {
                edges.push(Edge::new(source, MINER, fee, EdgeKind::Fee));
            }
        }
        Ok(edges)
    }
}

/// Per-block statistics, persisted alongside the graph.
#[derive(Debug, Clone, Default)]
pub struct BlockStatistics {
    pub height: u64,
    pub transactions: usize,
    pub generation_edges: usize,
    pub generation_sum: Amount,
    pub transfer_edges: usize,
    pub transfer_sum: Amount,
    pub change_adjusted_edges: usize,
    pub change_adjusted_sum: Amount,
    pub fee_edges: usize,
    pub fee_sum: Amount,
    pub elapsed_ms: u64,
}

impl BlockStatistics {
    pub fn header() -> &'static str {
        "height\ttransactions\tgeneration_edges\tgeneration_sum\t\
         transfer_edges\ttransfer_sum\tchange_adjusted_edges\t\
         change_adjusted_sum\tfee_edges\tfee_sum\telapsed_ms"
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.height,
            self.transactions,
            self.generation_edges,
            self.generation_sum,
            self.transfer_edges,
            self.transfer_sum,
            self.change_adjusted_edges,
            self.change_adjusted_sum,
            self.fee_edges,
            self.fee_sum,
            self.elapsed_ms,
        )
    }

    fn record(&mut self, edge: &Edge) {
        match edge.kind {
            EdgeKind::Generation => {
                self.generation_edges += 1;
                self.generation_sum += edge.value;
            }
            EdgeKind::Transfer => {
                self.transfer_edges += 1;
                self.transfer_sum += edge.value;
            }
            EdgeKind::ChangeAdjustedTransfer => {
                self.change_adjusted_edges += 1;
                self.change_adjusted_sum += edge.value;
            }
            EdgeKind::Fee => {
                self.fee_edges += 1;
                self.fee_sum += edge.value;
            }
        }
    }
}

/// The assembled value-flow graph for one block.
#[derive(Debug, Default)]
pub struct BlockGraph {
    pub height: u64,
    pub hash: String,
    nodes: BTreeSet<String>,
    edges: Vec<Edge>,
    pub stats: BlockStatistics,
}

impl BlockGraph {
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        BlockGraph {
            height,
            hash: hash.into(),
            nodes: BTreeSet::new(),
            edges: Vec::new(),
            stats: BlockStatistics {
                height,
                ..Default::default()
            },
        }
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.stats.record(&edge);
        self.nodes.insert(edge.source.clone());
        self.nodes.insert(edge.target.clone());
        self.edges.push(edge);
    }

    pub fn add_edges(&mut self, edges: Vec<Edge>) {
        for edge in edges {
            self.add_edge(edge);
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
