//! Error types for the relay and the image-host API.
//!
//! # Design
//! `RelayError` covers everything that can go wrong moving a request across
//! the relay: the channel, the executor, the bridge. A failure envelope that
//! came back from the endpoint lands in `Remote` with the endpoint's message
//! verbatim, so callers can pattern-match on it. Channel-level trouble stays
//! in `Channel`/`Timeout`, distinct from anything HTTP-shaped.
//!
//! `ApiError` is what `ImageHost` operations return. HTTP-level failures
//! carry the status and the server's message for auth-pattern checks.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while relaying a request.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The descriptor had no URL. Rejected before any network call.
    #[error("no url")]
    MissingUrl,

    /// The message could not be delivered or nobody answered it.
    #[error("channel error: {0}")]
    Channel(String),

    /// No reply arrived within the configured window.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The endpoint answered with a failure envelope.
    #[error("{0}")]
    Remote(String),

    /// The executor could not complete the network call.
    #[error("network error: {0}")]
    Network(String),

    /// A file part carried bytes that are not valid base64.
    #[error("invalid file payload: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The page-context bridge failed or was unreachable.
    #[error("bridge error: {0}")]
    Bridge(String),

    /// `open_panel` arrived but no panel host is registered.
    #[error("panel not ready")]
    PanelNotReady,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint answered a message with a reply of the wrong kind.
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

/// Errors returned by `ImageHost` operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server rejected the credential (status 401/403).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Any other non-200 response.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// A 200 response that still reported failure.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The file's leading bytes match no supported image format.
    #[error("unsupported image format")]
    UnsupportedImage,

    #[error("file too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    /// The response body did not have the expected shape.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl ApiError {
    /// Human-readable message used for auth-pattern matching.
    pub fn message(&self) -> String {
        match self {
            ApiError::Unauthorized(msg) | ApiError::Rejected(msg) => msg.clone(),
            ApiError::Http { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
