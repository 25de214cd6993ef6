/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header contains an invalid magic number.
    #[error("invalid frame magic (expected 0x4D42 \"MB\")")]
    InvalidMagic,

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The frame header names a message kind this protocol does not define.
    #[error("unknown message kind {0}")]
    UnknownKind(u16),

    /// The payload does not match the shape required by its kind.
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: &'static str,
        source: serde_json::Error,
    },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received,
    /// or a write was attempted on a closed channel.
    #[error("connection closed")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether this error describes a malformed byte stream rather than a
    /// broken pipe. Both are fatal to the channel.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidMagic
                | FrameError::PayloadTooLarge { .. }
                | FrameError::UnknownKind(_)
                | FrameError::Malformed { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
