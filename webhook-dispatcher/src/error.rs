use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by registry and configuration operations.
///
/// Delivery failures never surface here; they are reported in
/// [`DispatchResult`](crate::types::DispatchResult) values instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid webhook url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid config for webhook `{id}`: {reason}")]
    InvalidConfig { id: String, reason: String },

    #[error("invalid event name: {0:?}")]
    InvalidEvent(String),

    #[error("webhook not found: {0}")]
    UnknownWebhook(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),

    #[error("failed to encode event: {0}")]
    Encode(String),

    #[error("failed to sign payload: {0}")]
    Signing(String),

    #[error("registry store error: {0}")]
    Store(String),
}
