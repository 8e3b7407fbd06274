//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Data-model or graph-builder error from the core crate.
    #[error(transparent)]
    Core(#[from] ledgergraph_core::Error),

    /// The node answered, but with a status or body we cannot use.
    #[error("node error: {0}")]
    Node(String),

    /// The node could not be reached even after the full retry budget.
    #[error("node inaccessible: {0}")]
    NodeInaccessible(String),

    /// Transport-level failure talking to the node.
    #[error("transport error: {0}")]
    Transport(String),

    /// A request ran past its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit open; retry after {0:?}")]
    CircuitOpen(std::time::Duration),

    /// The node follows a different chain than the one configured.
    #[error("wrong chain: node follows `{actual}`, expected `{expected}`")]
    WrongChain { expected: String, actual: String },

    /// Requested height is beyond the node's chain head.
    #[error("invalid height {height}: chain head is {head}")]
    InvalidHeight { height: u64, head: u64 },

    /// The node returned something that is not a block hash.
    #[error("invalid block hash: {0:?}")]
    InvalidHash(String),

    /// An input references an output the node cannot produce.
    #[error("missing output {txid}:{vout}")]
    MissingOutput { txid: String, vout: u32 },

    /// A durable writer refused a record because it is closed.
    #[error("writer `{0}` is closed")]
    WriterClosed(String),

    /// A durable writer hit an unrecoverable serialization or I/O failure.
    #[error("writer `{0}` failed fatally")]
    WriterFatal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Recovery log parsing error.
    #[error("recovery log error: {0}")]
    Recovery(String),

    /// Shutdown was requested while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether retrying the same call could plausibly succeed.
    ///
    /// An open circuit is retriable: the breaker recloses on its own and the
    /// retry layer's backoff is what rides out the break window.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Timeout(_) | Error::CircuitOpen(_)
        )
    }

    /// Whether this error is the shutdown signal surfacing through a call.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Fold a transient failure that survived a full retry budget into
    /// [`Error::NodeInaccessible`]; everything else passes through.
    pub(crate) fn after_retries(self) -> Error {
        if self.is_transient() {
            Error::NodeInaccessible(self.to_string())
        } else {
            self
        }
    }
}
