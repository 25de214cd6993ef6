//! Media engine process supervisor.
//!
//! Spawns the engine executable, attaches a [`FramedChannel`] to its
//! stdin/stdout, forwards its stderr to tracing and tracks its lifecycle:
//!
//! ```text
//! Spawning ──▶ Running ──▶ Closed   (shutdown requested)
//!                     └──▶ Crashed  (exit, EOF or protocol fault while running)
//! ```
//!
//! [`FramedChannel`]: mediabridge_frame::FramedChannel

pub mod config;
pub mod error;
pub mod status;
pub mod supervisor;

pub use config::{SpawnConfig, DEFAULT_GRACE_PERIOD};
pub use error::{ProcessError, Result};
pub use status::{ExitInfo, LifecycleState, ProcessStatus};
pub use supervisor::{EngineProcess, ENGINE_LOG_TARGET};
