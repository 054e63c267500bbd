use thiserror::Error;

/// Relay engine errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("packet too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
