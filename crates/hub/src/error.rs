//! Error types for the relay hub.

use std::time::Duration;

use askhub_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CANCELLED, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_CONNECTED, WS_ERR_CODE_TIMEOUT,
};

/// Errors produced by hub operations.
///
/// Routing failures are returned to the caller as values so the calling
/// application can tell its end user that an expert is unavailable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error("'{identity}' is not connected")]
    NotConnected { identity: String },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("no pending request for correlation id {correlation_id}")]
    DuplicateCompletion { correlation_id: String },

    #[error("cancelled")]
    Cancelled,

    #[error("send failed: buffer full or connection closed")]
    SendFailed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl HubError {
    /// Wire error code reported to the remote caller.
    pub fn code(&self) -> i32 {
        match self {
            HubError::NotConnected { .. } => WS_ERR_CODE_NOT_CONNECTED,
            HubError::Timeout { .. } => WS_ERR_CODE_TIMEOUT,
            HubError::DuplicateCompletion { .. } => WS_ERR_CODE_CONFLICT,
            HubError::Cancelled => WS_ERR_CODE_CANCELLED,
            HubError::SendFailed => WS_ERR_CODE_INTERNAL,
            HubError::Protocol(_) => WS_ERR_CODE_BAD_REQUEST,
        }
    }

    pub(crate) fn timeout(what: impl Into<String>, after: Duration) -> Self {
        HubError::Timeout {
            what: what.into(),
            after,
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Protocol(e.to_string())
    }
}

/// Errors produced by the WebSocket server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection rejected: missing '{0}' query parameter")]
    MissingIdentity(&'static str),
}
