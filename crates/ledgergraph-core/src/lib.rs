//! Core types and algorithms for the ledger graph pipeline.
//!
//! This crate provides:
//! - Fixed-point amounts with the ledger's eight-digit rounding rules
//! - The data model served by a node's REST query interface
//! - The transaction graph builder (change and fee inference)
//! - Shared error types

pub mod amount;
mod error;
pub mod graph;
pub mod model;

pub use amount::{Amount, Fraction, FRACTIONAL_DIGITS, UNITS_PER_COIN};
pub use error::{Error, Result};
pub use graph::{
    BlockGraph, BlockStatistics, Edge, EdgeKind, TransactionGraph, COINBASE, MINER,
};
pub use model::{
    Block, ChainInfo, Input, Output, ScriptKind, ScriptPubKey, Transaction,
};
