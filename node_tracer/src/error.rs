use thiserror::Error;

/// An error raised by a [`TraceEngine`](crate::TraceEngine) or while
/// preparing one of the node-backed engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine configuration could not be loaded from the environment.
    #[error("invalid engine configuration: {0}")]
    Config(String),

    /// The node URL of a request is not a valid URL.
    #[error("invalid node url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// An address, storage key or storage value is not valid hex of the
    /// expected width.
    #[error("invalid {what} {value:?}: {reason}")]
    InvalidHex {
        what: &'static str,
        value: String,
        reason: String,
    },

    /// Storage override keys and values do not pair up.
    #[error("storage override mismatch: {keys} keys but {values} values")]
    OverrideMismatch { keys: usize, values: usize },

    /// The shared async runtime could not be started.
    #[error("failed to start async runtime: {0}")]
    Runtime(#[from] std::io::Error),

    /// A JSON-RPC exchange with the node failed.
    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
}
