//! Request multiplexer for the media engine control channel.
//!
//! Correlates outgoing requests with their responses by id, enforces
//! per-call deadlines, and routes notifications to listeners registered
//! per `(target, event)` pair. Notifications nobody listens to are dropped.

pub mod error;
pub mod multiplexer;
pub mod subscription;

pub use error::{Result, RpcError};
pub use multiplexer::{Multiplexer, RpcConfig, DEFAULT_REQUEST_TIMEOUT};
pub use subscription::Subscription;
