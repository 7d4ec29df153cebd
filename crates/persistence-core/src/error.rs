//! Error types for blob and queue persistence
//!
//! Backend failures are normalized into this taxonomy as close to the wire as
//! possible, so callers can branch on semantic outcomes instead of HTTP codes.

use thiserror::Error;

/// Result type alias using the persistence Error
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP statuses the storage service uses for throttling and transient faults
const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Core error type for blob and queue persistence
#[derive(Error, Debug)]
pub enum Error {
    // Blob errors
    #[error("Blob already exists: {blob}")]
    BlobAlreadyExists { blob: String },

    #[error("Blob not found: {blob}")]
    BlobNotFound { blob: String },

    // Lease errors
    #[error("Lease already exists on blob {blob}: {reason}")]
    LeaseAlreadyExists { blob: String, reason: String },

    #[error("Lease not found for blob: {blob}")]
    LeaseNotFound { blob: String },

    // Queue errors
    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    // Unrecognized backend errors, propagated verbatim
    #[error(
        "Storage service error: HTTP {status} ({}): {message}",
        code.as_deref().unwrap_or("unknown")
    )]
    Service {
        status: u16,
        code: Option<String>,
        message: String,
    },

    // Network errors, raised before a response was received
    #[error("Transport error: {message}")]
    Transport { message: String },

    // Lifecycle errors
    #[error("Store is closed: {name}")]
    Closed { name: String },

    // Caller errors
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Returns true if this error is transient and the operation may be retried
    ///
    /// Application-level outcomes (missing blobs, lease conflicts, stale
    /// delete tokens) are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Service { status, .. } => TRANSIENT_STATUSES.contains(status),
            _ => false,
        }
    }

    /// Returns the backend error code for unrecognized service errors
    pub fn service_code(&self) -> Option<&str> {
        match self {
            Error::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
