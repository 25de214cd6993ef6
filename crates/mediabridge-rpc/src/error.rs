use std::time::Duration;

use mediabridge_frame::FrameError;

/// Errors that can occur while issuing calls to the engine.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Frame-level error while writing the request.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The engine rejected the request. Local to this call.
    #[error("{method} rejected by engine: {reason}")]
    Remote {
        method: String,
        reason: String,
        detail: Option<String>,
    },

    /// No response within the deadline. The outcome on the engine is unknown.
    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    /// The control channel is closed; no further calls are possible.
    #[error("control channel closed")]
    ChannelClosed,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// True if the engine answered with a rejection.
    pub fn is_remote(&self) -> bool {
        matches!(self, RpcError::Remote { .. })
    }

    /// True if the call was abandoned locally after its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }

    /// Rejection reason sent by the engine, if any.
    pub fn remote_reason(&self) -> Option<&str> {
        match self {
            RpcError::Remote { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
