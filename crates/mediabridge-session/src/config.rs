use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use mediabridge_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};
use mediabridge_process::{SpawnConfig, DEFAULT_GRACE_PERIOD};
use mediabridge_rpc::{RpcConfig, DEFAULT_REQUEST_TIMEOUT};

/// Verbosity passed to the engine as `--logLevel=<level>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineLogLevel {
    Debug,
    Warn,
    #[default]
    Error,
    None,
}

impl EngineLogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineLogLevel::Debug => "debug",
            EngineLogLevel::Warn => "warn",
            EngineLogLevel::Error => "error",
            EngineLogLevel::None => "none",
        }
    }
}

impl fmt::Display for EngineLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(EngineLogLevel::Debug),
            "warn" => Ok(EngineLogLevel::Warn),
            "error" => Ok(EngineLogLevel::Error),
            "none" => Ok(EngineLogLevel::None),
            other => Err(format!("unknown engine log level: {other}")),
        }
    }
}

/// How to launch and talk to the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interpreter or executable that runs the engine.
    pub program: PathBuf,
    /// Engine entry point, passed as the first argument.
    pub script: PathBuf,
    pub log_level: EngineLogLevel,
    /// Appended after the fixed arguments.
    pub extra_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Working directory of the engine; inherited when `None`.
    pub current_dir: Option<PathBuf>,
    /// Deadline for every engine call.
    pub request_timeout: Duration,
    /// Time the engine gets to exit after a termination request.
    pub shutdown_grace: Duration,
    /// Largest accepted control record payload.
    pub max_payload_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("python3"),
            script: PathBuf::from("worker.py"),
            log_level: EngineLogLevel::default(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            current_dir: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_GRACE_PERIOD,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl EngineConfig {
    pub fn new(program: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn with_log_level(mut self, log_level: EngineLogLevel) -> Self {
        self.log_level = log_level;
        self
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Engine arguments: `[script, --logLevel=<level>, extra_args...]`.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(2 + self.extra_args.len());
        args.push(self.script.display().to_string());
        args.push(format!("--logLevel={}", self.log_level));
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }

    pub fn spawn_config(&self) -> SpawnConfig {
        let mut spawn = SpawnConfig::new(self.program.clone())
            .with_args(self.args())
            .with_grace_period(self.shutdown_grace);
        spawn.env = self.env.clone();
        spawn.current_dir = self.current_dir.clone();
        spawn.frame = self.frame_config();
        spawn
    }

    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig::default().with_default_timeout(self.request_timeout)
    }
}
