//! Error types for flow-relay
//!
//! Every failure a job can run into maps onto one `RelayError` variant. Only
//! some of them end a job: malformed stream frames and transcript write
//! failures are recorded for visibility and otherwise ignored.

use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while relaying a job
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Malformed or incomplete inbound job
    #[error("Invalid job payload: {0}")]
    Decode(String),

    /// Missing external endpoint or credential
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Network or HTTP failure talking to the execution service
    #[error("Flow API request error: {message}")]
    Transport {
        /// Human readable description
        message: String,
        /// Upstream HTTP status, when a response was received
        status_code: Option<u16>,
        /// Upstream error detail (decoded body or its first 500 characters)
        detail: Option<serde_json::Value>,
    },

    /// A single stream frame could not be decoded
    #[error("Failed to decode stream frame: {0}")]
    FrameDecode(String),

    /// Transcript write failure
    #[error("Transcript persistence error: {0}")]
    Persistence(String),

    /// Outbound event could not be published
    #[error("Publish error: {0}")]
    Publish(String),

    /// Unexpected internal failure
    #[error("Internal worker error: {0}")]
    Internal(String),
}

/// Result type for flow-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Build a transport error without upstream response information.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status_code: None,
            detail: None,
        }
    }

    /// Whether this error ends the job with an `error` terminal event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::Configuration(_) | Self::Transport { .. } | Self::Internal(_)
        )
    }

    /// Upstream HTTP status code, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Transport { status_code, .. } => *status_code,
            _ => None,
        }
    }

    /// Upstream error detail, if any.
    pub fn detail(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Transport { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }

    /// Payload carried by the `error` terminal event.
    pub fn to_error_payload(&self) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            detail: self.detail().cloned(),
            status_code: self.status_code(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON serialization failed: {err}"))
    }
}

/// Body of an `error` event: `{message, detail?, status_code?}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}
