//! Error types for nodevault

use thiserror::Error;

/// Main error type for nodevault operations
///
/// Every capability adapter classifies its backend failures into one of these
/// variants so the engine, guard and controller can decide between failing,
/// retrying and reporting without inspecting transport details.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed configuration or request; nothing was written
    #[error("validation error: {0}")]
    Validation(String),

    /// Resource-version mismatch or duplicate identity; re-read and retry
    #[error("conflict: {0}")]
    Conflict(String),

    /// Delete blocked by a live dependent resource
    #[error("in use: {0}")]
    InUse(String),

    /// Template, node pool or secret is absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Secret or resource store unreachable
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A bounded wait elapsed before its condition held
    #[error("timed out: {0}")]
    Timeout(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Persisted state violates an invariant and cannot be repaired automatically
    #[error("inconsistent state: {0}")]
    Inconsistent(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an in-use error with the given message
    pub fn in_use(msg: impl Into<String>) -> Self {
        Self::InUse(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a backend-unavailable error with the given message
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an inconsistency error with the given message
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::Inconsistent(msg.into())
    }

    /// Whether repeating the whole operation may succeed without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    /// Whether this error reports an absent object
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Short machine-readable name of the error class
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation",
            Self::Conflict(_) => "Conflict",
            Self::InUse(_) => "InUse",
            Self::NotFound(_) => "NotFound",
            Self::BackendUnavailable(_) => "BackendUnavailable",
            Self::Timeout(_) => "Timeout",
            Self::Serialization(_) => "Serialization",
            Self::Inconsistent(_) => "Inconsistent",
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => Self::NotFound(resp.message),
                409 => Self::Conflict(resp.message),
                429 => Self::BackendUnavailable(resp.message),
                code if code >= 500 => Self::BackendUnavailable(resp.message),
                _ => Self::Validation(resp.message),
            },
            kube::Error::SerdeError(e) => Self::Serialization(e.to_string()),
            other => Self::BackendUnavailable(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
