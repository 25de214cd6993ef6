use std::path::PathBuf;

/// Errors that can occur while supervising the engine process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The executable could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    /// A standard stream was not piped as requested.
    #[error("engine process has no {0} pipe")]
    MissingStdio(&'static str),

    /// An I/O error occurred while managing the process.
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The supervisor went away before the process reached a terminal state.
    #[error("shutdown failed: {0}")]
    ShutdownFailed(String),
}

pub type Result<T> = std::result::Result<T, ProcessError>;
