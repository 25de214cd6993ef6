//! Length-prefixed message framing for the engine control channel.
//!
//! Every record is framed with:
//! - A 2-byte magic number ("MB") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian message kind (request, response, notification)
//!
//! followed by a JSON payload. [`FramedChannel`] owns both halves of a byte
//! stream: a single serialized write path and an in-order read loop.

pub mod channel;
pub mod codec;
pub mod error;
pub mod kind;
pub mod message;

pub use channel::{CloseReason, FramedChannel, Inbound};
pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, MessageCodec, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use kind::{kind_name, NOTIFICATION, REQUEST, RESPONSE};
pub use message::{Message, Notification, RemoteError, Request, Response};
