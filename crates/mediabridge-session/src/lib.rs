//! Session controller for a remotely driven media engine.
//!
//! [`Engine`] owns the control channel (and, when spawned, the engine
//! process). It acquires [`MediaSource`]s and creates [`Handler`]s through a
//! [`HandlerFactory`]. Handlers simulate one peer connection each: they track
//! transceivers, mids and connection state from confirmed engine replies and
//! notifications only.
//!
//! ```no_run
//! use mediabridge_session::{
//!     Direction, Engine, EngineConfig, HandlerOptions, MediaKind, MediaSourceSpec,
//!     ProduceOptions, TrackSourceSpec,
//! };
//!
//! # async fn run() -> mediabridge_session::Result<()> {
//! let engine = Engine::spawn(EngineConfig::new("python3", "worker.py"))?;
//! let source = engine
//!     .acquire_media_source(&MediaSourceSpec::audio_video(TrackSourceSpec::file("small.mp4")))
//!     .await?;
//! let handler = engine
//!     .create_handler_factory()?
//!     .create_handler(HandlerOptions::new(Direction::Send))
//!     .await?;
//! if let Some(track) = source.track(MediaKind::Audio) {
//!     let producer = handler.add_producing_track(track, ProduceOptions::default()).await?;
//!     println!("sending on mid {}", producer.mid());
//! }
//! engine.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dump;
pub mod engine;
pub mod error;
pub mod handle;
pub mod handler;
pub mod methods;
pub mod source;

pub use config::{EngineConfig, EngineLogLevel};
pub use dump::{
    EngineDump, HandlerDump, SendTransceiverDump, SenderDump, SourceDump, TrackDump,
    TransceiverDump,
};
pub use engine::{Engine, HandlerFactory};
pub use error::{Result, SessionError};
pub use handle::RemoteHandle;
pub use handler::{
    ConnectionState, ConsumeOptions, Consumer, DataChannel, DataChannelOptions, DataConsumer,
    DataProducer, Direction, Handler, HandlerOptions, ProduceOptions, Producer, TrackRef,
    TransceiverInfo,
};
pub use source::{
    MediaKind, MediaSource, MediaSourceSpec, MediaTrack, ReadyState, SourceOrigin,
    TrackSourceSpec,
};
