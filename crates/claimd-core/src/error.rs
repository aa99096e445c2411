use thiserror::Error;

/// Application-wide error types for claimd.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed before a response was received.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The remote answered with a non-success status.
    #[error("HTTP {status_code}: {message}")]
    HttpStatus { status_code: u16, message: String },

    /// Request or task timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Proxy could not be reached or rejected the tunnel.
    #[error("Proxy error: {0}")]
    ProxyError(String),

    /// External task logic failed without producing a result.
    #[error("Task error: {0}")]
    TaskError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Loading or saving persisted state failed.
    #[error("State store error: {0}")]
    StateError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem or process I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// HTTP status carried by this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::HttpStatus { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    /// Returns true for one-off network conditions (timeouts, resets, refused connections).
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) => true,
            AppError::HttpError(msg) => {
                msg.contains("timeout") || msg.contains("connect") || msg.contains("reset")
            }
            _ => false,
        }
    }
}
