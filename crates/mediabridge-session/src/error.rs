use mediabridge_process::ProcessError;
use mediabridge_rpc::RpcError;

use crate::handler::Direction;

/// Errors surfaced by the engine session and its handlers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A call to the engine failed (timeout, remote rejection, closed channel).
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The engine process could not be started or stopped.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// JSON serialization error while building a request.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The requested media source origin is not supported.
    #[error("unsupported media source: {0}")]
    UnsupportedSource(String),

    /// The arguments were rejected before reaching the engine.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine, handler or handle has been closed.
    #[error("{0} closed")]
    Closed(&'static str),

    /// No transceiver with this mid exists in the handler.
    #[error("unknown transceiver mid {0:?}")]
    UnknownTransceiver(String),

    /// The operation is not available for the handler's direction.
    #[error("{operation} not allowed on a {direction} handler")]
    WrongDirection {
        operation: &'static str,
        direction: Direction,
    },

    /// Remote transport parameters were already set.
    #[error("remote transport parameters already set")]
    AlreadyConfigured,

    /// The engine reported a mid that was already used in this session.
    #[error("engine reused mid {0:?}")]
    DuplicateMid(String),

    /// The engine answered with data of an unexpected shape.
    #[error("unexpected {method} response: {detail}")]
    UnexpectedResponse {
        method: &'static str,
        detail: String,
    },
}

impl SessionError {
    /// True if the failure is due to a closed engine, handler or handle,
    /// either detected locally or reported by the control channel.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            SessionError::Closed(_) | SessionError::Rpc(RpcError::ChannelClosed)
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Decode a response payload, mapping shape mismatches to `UnexpectedResponse`.
pub(crate) fn decode<T>(method: &'static str, value: serde_json::Value) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(value).map_err(|err| SessionError::UnexpectedResponse {
        method,
        detail: err.to_string(),
    })
}
