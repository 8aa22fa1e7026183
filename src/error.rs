//! Error types for device communication and record decoding.

use thiserror::Error;

/// Result type alias for all fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for device communication and record decoding.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller violated an API contract (wrong fingerprint length,
    /// undersized buffer).
    #[error("invalid arguments")]
    InvalidArgs,

    /// Transport-level failure (port disconnected, OS error). Never retried.
    #[error("transport I/O error")]
    Io(#[from] std::io::Error),

    /// No (complete) response arrived within the receive deadline.
    #[error("timeout waiting for device response")]
    Timeout,

    /// Response frame failed validation: bad header, length or checksum.
    #[error("corrupted response packet")]
    Protocol,

    /// Structurally valid bytes with semantically invalid content, such as
    /// a ringbuffer pointer outside its window or a broken dive chain.
    #[error("unexpected data layout on the device")]
    DataFormat,

    /// Operation not implemented by this device backend.
    #[error("operation not supported by this device")]
    Unsupported,
}

impl Error {
    /// Returns true if reissuing the command may succeed.
    ///
    /// Timeouts and corrupted packets are transient (electrical noise,
    /// dropped commands); everything else is not worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Protocol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Protocol.is_retryable());
        assert!(!Error::DataFormat.is_retryable());
        assert!(!Error::InvalidArgs.is_retryable());
        assert!(!Error::Io(std::io::Error::other("gone")).is_retryable());
    }
}
