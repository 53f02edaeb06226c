use thiserror::Error;

/**
    Errors surfaced by the demux bridge.

    Failures that happen on graph worker threads never surface here directly;
    they are recorded by the engine and reported by the `connect` call that is
    waiting on them.
*/
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation not valid in the current state: {0}")]
    InvalidState(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    #[error("graph error: {0}")]
    Graph(String),

    #[error("expected {expected} streams, found {found}")]
    StreamCount { expected: usize, found: usize },

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("no buffer is held by the stream")]
    NoBuffer,

    #[error("range {offset}+{len} exceeds buffer of {size} bytes")]
    OutOfRange { offset: usize, len: usize, size: usize },

    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type alias using the bridge [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
