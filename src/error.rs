use std::sync::Arc;

use crate::api::ApiError;
use crate::resolution_cache::ApplyStatus;

/// Represents a result type for operations in the Beacon SDK.
///
/// This type alias is used throughout the SDK to indicate the result of operations that may return
/// errors specific to the Beacon SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the Beacon SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The evaluation context carries no targeting key. Resolutions cannot be cached or correlated
    /// without one.
    #[error("evaluation context is missing a targeting key")]
    TargetingKeyMissing,

    /// The caller's resolve token belongs to a superseded cache generation. The report must be
    /// discarded by the caller, not merged.
    #[error("resolve token does not match the current cache generation")]
    ContextStale,

    /// The requested flag is not present in the cache.
    #[error("flag not found")]
    FlagNotFound,

    /// The requested apply-status transition is not allowed by the state machine. Most notably,
    /// re-entering `Applying` after `Applied` signals a caller bug.
    #[error("illegal apply-status transition from {from:?} to {to:?}")]
    IllegalApplyTransition {
        /// Status the cached entry is currently in.
        from: ApplyStatus,
        /// Status the caller attempted to move to.
        to: ApplyStatus,
    },

    /// The transport layer produced no parseable HTTP response (connection failure, timeout,
    /// malformed body).
    #[error("transport produced no usable response")]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    InvalidResponse(#[source] Arc<reqwest::Error>),

    /// The server answered with a non-200 status.
    #[error("request failed with status {status}")]
    RequestFailed {
        /// HTTP status code of the response.
        status: reqwest::StatusCode,
        /// Structured error body, if the server sent one (or one synthesized from the raw body).
        detail: Option<ApiError>,
    },

    /// A request body or persisted document could not be encoded or decoded as JSON.
    #[error("failed to encode or decode JSON")]
    EncodingFailed(#[source] Arc<serde_json::Error>),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// An I/O error from the storage collaborator.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::EncodingFailed(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::InvalidResponse(Arc::new(value.without_url()))
    }
}
