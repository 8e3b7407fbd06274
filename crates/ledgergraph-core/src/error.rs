//! Error types for the core ledger model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the data model and the graph builder.
#[derive(Error, Debug)]
pub enum Error {
    /// A value-bearing output carries a script classification outside the
    /// known set. Treated as a data-model violation, never defaulted.
    #[error("unknown script kind `{kind}` on output {txid}:{vout}")]
    UnknownScriptKind {
        kind: String,
        txid: String,
        vout: u32,
    },

    /// More than one output returns value to an input address. The ledger
    /// gives no tie-break rule for picking "the" change output, so none is
    /// invented.
    #[error("unsupported transaction shape in {txid}: {candidates} change-output candidates")]
    UnsupportedTxShape { txid: String, candidates: usize },

    /// Outputs exceed inputs; violates value conservation.
    #[error("negative fee in {txid}: inputs {total_in}, outputs {total_out}")]
    NegativeFee {
        txid: String,
        total_in: String,
        total_out: String,
    },

    /// A block arrived without a coinbase transaction.
    #[error("block {hash} has no coinbase transaction")]
    NoCoinbase { hash: String },
}
