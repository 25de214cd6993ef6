use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use mediabridge_frame::FrameConfig;

/// Default time a process gets to exit after a graceful termination request.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// How to launch the engine process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
    /// Extra environment variables (the parent environment is inherited).
    pub env: BTreeMap<String, String>,
    /// Working directory; inherited when `None`.
    pub current_dir: Option<PathBuf>,
    /// Time between the graceful termination request and a forced kill.
    pub grace_period: Duration,
    /// Framing limits for the control channel on stdin/stdout.
    pub frame: FrameConfig,
}

impl SpawnConfig {
    /// Launch `program` with no arguments and default limits.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            grace_period: DEFAULT_GRACE_PERIOD,
            frame: FrameConfig::default(),
        }
    }

    /// Append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Override the grace period.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates() {
        let cfg = SpawnConfig::new("python3")
            .with_args(["worker.py", "--logLevel=warn"])
            .with_args(vec!["--extra".to_string()])
            .with_env("PYTHONUNBUFFERED", "1")
            .with_grace_period(Duration::from_millis(250));

        assert_eq!(cfg.program, PathBuf::from("python3"));
        assert_eq!(cfg.args, vec!["worker.py", "--logLevel=warn", "--extra"]);
        assert_eq!(cfg.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert_eq!(cfg.grace_period, Duration::from_millis(250));
        assert!(cfg.current_dir.is_none());
    }
}
