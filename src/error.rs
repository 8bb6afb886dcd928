//! Error types for the control plane.

use thiserror::Error;

/// Result type alias using the control plane's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur anywhere in the control plane.
#[derive(Error, Debug)]
pub enum Error {
    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request from a caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A uniqueness or state invariant would be violated.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The backend's circuit breaker is open.
    #[error("circuit open for backend {backend}")]
    CircuitOpen { backend: String },

    /// A dependency is transiently unavailable.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// SQLite storage error.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound HTTP error calling a backend or moderation service.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create a `Conflict` error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Create a `CircuitOpen` error for `backend`.
    pub fn circuit_open(backend: impl Into<String>) -> Self {
        Self::CircuitOpen {
            backend: backend.into(),
        }
    }

    /// Create an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Map to the wire-level error code used by the public API surface (§6).
    pub fn as_api_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not_found",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Conflict(_) => "conflict",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::Unavailable(_) => "unavailable",
            Error::Storage(_) => "unavailable",
            Error::Transport(_) => "unavailable",
            Error::Serialization(_) => "internal",
            Error::Internal(_) => "internal",
        }
    }
}
