//! Host-side controller for an out-of-process WebRTC media engine.
//!
//! mediabridge drives a media engine running in a child process over a framed
//! request/response/notification channel on its stdio, and exposes the
//! engine's sources and peer-connection handlers as local objects.
//!
//! # Crate Structure
//!
//! - [`frame`]: Wire codec and async framed channel
//! - [`process`]: Engine process supervisor and lifecycle
//! - [`rpc`]: Request multiplexer and notification subscriptions
//! - [`session`]: Engine controller, media sources and handlers
//! - [`logging`]: `tracing` subscriber bootstrap (behind `logging` feature)

/// Re-export frame types.
pub mod frame {
    pub use mediabridge_frame::*;
}

/// Re-export process types.
pub mod process {
    pub use mediabridge_process::*;
}

/// Re-export rpc types.
pub mod rpc {
    pub use mediabridge_rpc::*;
}

/// Re-export session types.
pub mod session {
    pub use mediabridge_session::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use mediabridge_session::{
    ConnectionState, Direction, Engine, EngineConfig, Handler, HandlerFactory, HandlerOptions,
    MediaKind, MediaSource, MediaSourceSpec, MediaTrack, Result, SessionError, TrackSourceSpec,
};
