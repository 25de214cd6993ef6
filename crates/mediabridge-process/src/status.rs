use std::fmt;
use std::process::ExitStatus;

/// Lifecycle of one engine process.
///
/// `Spawning → Running → {Closed, Crashed}`. Both end states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Spawning,
    Running,
    Closed,
    Crashed,
}

impl LifecycleState {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Closed | LifecycleState::Crashed)
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::Spawning, LifecycleState::Running)
                | (LifecycleState::Running, LifecycleState::Closed)
                | (LifecycleState::Running, LifecycleState::Crashed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Spawning => "spawning",
            LifecycleState::Running => "running",
            LifecycleState::Closed => "closed",
            LifecycleState::Crashed => "crashed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process ended: exit code, or the signal that killed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Snapshot published on every lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStatus {
    pub state: LifecycleState,
    /// Present once the process has been reaped.
    pub exit: Option<ExitInfo>,
}

impl ProcessStatus {
    pub(crate) fn spawning() -> Self {
        Self {
            state: LifecycleState::Spawning,
            exit: None,
        }
    }
}
