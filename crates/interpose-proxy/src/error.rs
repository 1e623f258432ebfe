//! Error types for the proxy.

use thiserror::Error;

use interpose_core::PortError;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No free port at or above the requested one.
    #[error("Port allocation failed: {0}")]
    PortAllocationFailed(#[from] PortError),

    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Proxy server error.
    #[error("Proxy error: {0}")]
    Proxy(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_error_converts() {
        let err: ProxyError = PortError::NoPortAvailable { start: 9000 }.into();
        assert!(matches!(err, ProxyError::PortAllocationFailed(_)));
        assert!(err.to_string().contains("9000"));
    }
}
