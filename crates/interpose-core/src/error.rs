//! Error types for the capture primitives.

use thiserror::Error;

/// Port allocation error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    /// Every port from the starting port up to 65535 is taken.
    #[error("no available port in range {start}..=65535")]
    NoPortAvailable {
        /// First port that was tried.
        start: u16,
    },
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, PortError>;
