//! Error types for streamgate
//!
//! This module defines the error type used throughout the gateway,
//! using `thiserror` for ergonomic error handling. Upstream (MTProto)
//! failures have their own taxonomy in [`crate::upstream::UpstreamError`];
//! this enum covers everything that can surface at the HTTP edge or during
//! startup.

use crate::MessageId;
use thiserror::Error;

/// Main error type for gateway operations
///
/// Variants map onto the HTTP statuses the frontend emits: `InvalidUrl` and
/// `DescriptorNotFound` become 404, `InvalidRange` 400, `UnsatisfiableRange`
/// 416, and everything else a 500 carrying a short error id.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The request path matched neither URL shape
    #[error("invalid request URL")]
    InvalidUrl,

    /// No upstream session could produce a descriptor for the message
    #[error("no file descriptor for message {0}")]
    DescriptorNotFound(MessageId),

    /// The Range header was syntactically malformed
    #[error("invalid range header: {0}")]
    InvalidRange(String),

    /// The Range header was well-formed but outside the file bounds
    #[error("unsatisfiable range for file of {size} bytes")]
    UnsatisfiableRange {
        /// Total file size reported back in `Content-Range: bytes */<size>`
        size: u64,
    },

    /// No live session exists that could serve the request
    #[error("no fallback session available: {0}")]
    NoFallback(String),

    /// Configuration loading or validation errors
    #[error("configuration error: {0}")]
    Config(String),

    /// The primary session could not be started
    #[error("primary session failed to start: {0}")]
    PrimaryStart(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors from the optional config file
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Internal runtime error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias using [`GatewayError`]
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(GatewayError::InvalidUrl.to_string(), "invalid request URL");
        assert_eq!(
            GatewayError::DescriptorNotFound(42).to_string(),
            "no file descriptor for message 42"
        );
        assert_eq!(
            GatewayError::UnsatisfiableRange { size: 100 }.to_string(),
            "unsatisfiable range for file of 100 bytes"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: GatewayError = io.into();
        assert!(matches!(err, GatewayError::Io(_)));
    }
}
