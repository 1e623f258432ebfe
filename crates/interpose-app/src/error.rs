//! Application error types.

use interpose_proxy::ProxyError;
use thiserror::Error;

/// Errors raised while running the application.
#[derive(Debug, Error)]
pub enum AppError {
    /// The proxy could not be started.
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// The editor could not be spawned.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for application operations.
pub type Result<T> = std::result::Result<T, AppError>;
