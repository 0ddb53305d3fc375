//! Error types for the relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying a prompt to a backend
///
/// Usage limits and conversations closed by the backend are not errors; they
/// are folded into the response text by the adapters.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Transport could not be opened or a frame could not be sent
    #[error("Connection error: {0}")]
    Connection(String),

    /// Credential missing or rejected by the backend
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Backend reported a non-success status during bootstrap; retryable
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Backend sent something the adapter cannot interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend failed while serving an exchange
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend is not configured or configured with malformed values
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Exchange aborted through its cancellation token
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Operation exceeded its time budget
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RelayError {
    /// Whether bootstrap should try again after this error
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient(_))
    }
}
