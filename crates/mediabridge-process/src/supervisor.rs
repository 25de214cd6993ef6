use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use mediabridge_frame::{CloseReason, FramedChannel, Inbound};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SpawnConfig;
use crate::error::{ProcessError, Result};
use crate::status::{ExitInfo, LifecycleState, ProcessStatus};

/// Tracing target used for lines the engine writes to stderr.
pub const ENGINE_LOG_TARGET: &str = "mediabridge::engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    /// Any exit is a crash.
    Running,
    /// The owner asked the engine to exit on its own; an exit is graceful.
    Expected,
    /// Terminate now.
    Requested,
}

#[derive(Debug)]
enum Event {
    Exited(io::Result<ExitStatus>),
    ChannelClosed(CloseReason),
    StopRequested,
}

/// One running engine process with its control channel on stdin/stdout.
///
/// A background task watches the child, the channel and stop requests, and
/// publishes every lifecycle change on a [`watch`] channel. Dropping the
/// handle terminates the engine the same way [`shutdown`](Self::shutdown) does.
pub struct EngineProcess {
    pid: u32,
    channel: FramedChannel,
    status: watch::Receiver<ProcessStatus>,
    stop: watch::Sender<Stop>,
}

impl EngineProcess {
    /// Launch the engine and attach the control channel to its stdio.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: &SpawnConfig) -> Result<(Self, Inbound)> {
        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: config.program.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();

        let stdin = child.stdin.take().ok_or(ProcessError::MissingStdio("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::MissingStdio("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::MissingStdio("stderr"))?;

        let (status_tx, status_rx) = watch::channel(ProcessStatus::spawning());
        tokio::spawn(forward_stderr(stderr, pid));

        let (channel, inbound) = FramedChannel::open(stdout, stdin, config.frame.clone());
        transition(&status_tx, LifecycleState::Running, None);
        info!(pid, program = %config.program.display(), "engine process spawned");

        let (stop_tx, stop_rx) = watch::channel(Stop::Running);
        tokio::spawn(supervise(Supervised {
            child,
            channel: channel.clone(),
            status: status_tx,
            stop: stop_rx,
            grace: config.grace_period,
            pid,
        }));

        Ok((
            Self {
                pid,
                channel,
                status: status_rx,
                stop: stop_tx,
            },
            inbound,
        ))
    }

    /// OS process id (0 if the platform did not report one).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The control channel attached to the engine's stdin/stdout.
    pub fn channel(&self) -> &FramedChannel {
        &self.channel
    }

    pub fn state(&self) -> LifecycleState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.borrow()
    }

    /// Receiver that observes every lifecycle change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessStatus> {
        self.status.clone()
    }

    /// Wait until the process leaves `Running`. Resolves with the exit details
    /// if it died without being asked to, `None` if it was closed.
    pub async fn died(&self) -> Option<ExitInfo> {
        let status = self.wait_terminated().await.ok()?;
        (status.state == LifecycleState::Crashed).then(|| status.exit.unwrap_or_default())
    }

    /// Announce that the engine is about to exit on its own, so that its exit
    /// or end of output is recorded as `Closed` rather than `Crashed`.
    pub fn expect_exit(&self) {
        self.stop.send_if_modified(|stop| {
            if *stop == Stop::Running {
                *stop = Stop::Expected;
                true
            } else {
                false
            }
        });
    }

    /// Terminate the engine and wait for a terminal state.
    ///
    /// Closes the write half, sends a graceful termination signal and kills
    /// the process if it is still alive after the grace period. Idempotent;
    /// an engine that already crashed stays `Crashed`.
    pub async fn shutdown(&self) -> Result<ProcessStatus> {
        self.stop.send_modify(|stop| *stop = Stop::Requested);
        self.wait_terminated().await
    }

    /// Wait until the process reaches `Closed` or `Crashed`.
    pub async fn wait_terminated(&self) -> Result<ProcessStatus> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|status| status.state.is_terminal())
            .await
            .map_err(|_| ProcessError::ShutdownFailed("supervisor task ended".to_string()))?;
        Ok(*status)
    }
}

impl fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineProcess")
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish()
    }
}

struct Supervised {
    child: Child,
    channel: FramedChannel,
    status: watch::Sender<ProcessStatus>,
    stop: watch::Receiver<Stop>,
    grace: Duration,
    pid: u32,
}

async fn supervise(mut sup: Supervised) {
    let event = tokio::select! {
        exit = sup.child.wait() => Event::Exited(exit),
        reason = sup.channel.closed() => Event::ChannelClosed(reason),
        () = stop_requested(&mut sup.stop) => Event::StopRequested,
    };

    let graceful = match &event {
        Event::StopRequested | Event::ChannelClosed(CloseReason::Explicit) => true,
        _ => *sup.stop.borrow() != Stop::Running,
    };

    if graceful {
        debug!(pid = sup.pid, ?event, "stopping engine process");
        let exit = terminate(&mut sup.child, &sup.channel, sup.grace, sup.pid).await;
        finish(&sup.status, LifecycleState::Closed, exit, sup.pid);
        return;
    }

    let exit = match event {
        Event::Exited(exit) => exit,
        _ => {
            if let Err(err) = sup.child.start_kill() {
                debug!(pid = sup.pid, error = %err, "kill after channel failure");
            }
            sup.child.wait().await
        }
    };
    finish(&sup.status, LifecycleState::Crashed, exit, sup.pid);
    sup.channel.close().await;
}

async fn stop_requested(stop: &mut watch::Receiver<Stop>) {
    // A dropped handle counts as a request.
    let _ = stop.wait_for(|stop| *stop == Stop::Requested).await;
}

async fn terminate(
    child: &mut Child,
    channel: &FramedChannel,
    grace: Duration,
    pid: u32,
) -> io::Result<ExitStatus> {
    channel.close().await;

    if child.try_wait()?.is_none() {
        request_termination(child, pid);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(exit) => return exit,
            Err(_) => {
                warn!(pid, ?grace, "engine ignored termination request, killing");
                child.kill().await?;
            }
        }
    }
    child.wait().await
}

#[cfg(unix)]
fn request_termination(child: &mut Child, pid: u32) {
    let Some(id) = child.id() else {
        return;
    };
    // SAFETY: `id` belongs to a child that has not been reaped, so it cannot
    // have been recycled for another process.
    let rc = unsafe { libc::kill(id as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child, pid: u32) {
    if let Err(err) = child.start_kill() {
        debug!(pid, error = %err, "terminate failed");
    }
}

fn finish(
    status: &watch::Sender<ProcessStatus>,
    state: LifecycleState,
    exit: io::Result<ExitStatus>,
    pid: u32,
) {
    let exit = match exit {
        Ok(exit) => Some(ExitInfo::from(exit)),
        Err(err) => {
            warn!(pid, error = %err, "failed to reap engine process");
            None
        }
    };
    if transition(status, state, exit) {
        match state {
            LifecycleState::Crashed => warn!(pid, ?exit, "engine process died"),
            _ => info!(pid, ?exit, "engine process closed"),
        }
    }
}

fn transition(
    status: &watch::Sender<ProcessStatus>,
    next: LifecycleState,
    exit: Option<ExitInfo>,
) -> bool {
    status.send_if_modified(|current| {
        if !current.state.can_transition_to(next) {
            return false;
        }
        current.state = next;
        if exit.is_some() {
            current.exit = exit;
        }
        true
    })
}

async fn forward_stderr(stderr: ChildStderr, pid: u32) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: ENGINE_LOG_TARGET, pid, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(pid, error = %err, "engine stderr closed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use mediabridge_frame::{Message, Notification};
    use serde_json::json;

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn sh(script: &str) -> SpawnConfig {
        SpawnConfig::new("sh").with_args(["-c", script])
    }

    async fn terminated(process: &EngineProcess) -> ProcessStatus {
        tokio::time::timeout(WAIT, process.wait_terminated())
            .await
            .expect("process did not terminate")
            .unwrap()
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let err = EngineProcess::spawn(&SpawnConfig::new("/nonexistent/mediabridge-engine"))
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn loopback_through_cat_then_shutdown() {
        let (process, mut inbound) = EngineProcess::spawn(&SpawnConfig::new("cat")).unwrap();
        assert_eq!(process.state(), LifecycleState::Running);
        assert!(process.pid() > 0);

        let message = Message::Notification(Notification {
            target_id: "h-1".to_string(),
            event: "signalingstatechange".to_string(),
            data: json!({ "signalingState": "stable" }),
        });
        process.channel().send(message.clone()).await.unwrap();
        assert_eq!(inbound.recv().await, Some(message));

        let status = tokio::time::timeout(WAIT, process.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, LifecycleState::Closed);
        assert!(process.died().await.is_none());
        assert!(process.channel().is_closed());

        // Idempotent.
        let again = process.shutdown().await.unwrap();
        assert_eq!(again.state, LifecycleState::Closed);
    }

    #[tokio::test]
    async fn unexpected_exit_is_a_crash() {
        let (process, _inbound) = EngineProcess::spawn(&sh("exit 3")).unwrap();

        let status = terminated(&process).await;
        assert_eq!(status.state, LifecycleState::Crashed);
        assert_eq!(process.died().await.and_then(|exit| exit.code), Some(3));
        assert!(process.channel().is_closed());

        // A crashed engine stays crashed.
        let after = process.shutdown().await.unwrap();
        assert_eq!(after.state, LifecycleState::Crashed);
    }

    #[tokio::test]
    async fn expected_exit_is_closed() {
        let (process, _inbound) = EngineProcess::spawn(&sh("sleep 0.3")).unwrap();
        process.expect_exit();

        let status = terminated(&process).await;
        assert_eq!(status.state, LifecycleState::Closed);
        assert_eq!(status.exit.and_then(|exit| exit.code), Some(0));
    }

    #[tokio::test]
    async fn stubborn_engine_is_killed_after_grace() {
        let config = sh("trap '' TERM; exec sleep 30").with_grace_period(Duration::from_millis(100));
        let (process, _inbound) = EngineProcess::spawn(&config).unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let status = tokio::time::timeout(WAIT, process.shutdown())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, LifecycleState::Closed);
        assert_eq!(status.exit.and_then(|exit| exit.signal), Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn garbage_on_stdout_crashes_engine() {
        let (process, mut inbound) =
            EngineProcess::spawn(&sh("printf 'garbage!'; exec sleep 5")).unwrap();

        assert!(inbound.recv().await.is_none());
        let status = terminated(&process).await;
        assert_eq!(status.state, LifecycleState::Crashed);
        assert!(matches!(
            process.channel().close_reason(),
            Some(CloseReason::ProtocolFault(_))
        ));
    }

    #[tokio::test]
    async fn owner_closing_channel_stops_engine() {
        let (process, _inbound) = EngineProcess::spawn(&SpawnConfig::new("cat")).unwrap();
        process.channel().close().await;

        let status = terminated(&process).await;
        assert_eq!(status.state, LifecycleState::Closed);
    }

    #[tokio::test]
    async fn status_updates_are_observable() {
        let (process, _inbound) = EngineProcess::spawn(&sh("exit 0")).unwrap();
        let mut rx = process.subscribe();
        let status = tokio::time::timeout(WAIT, rx.wait_for(|s| s.state.is_terminal()))
            .await
            .unwrap()
            .map(|s| *s)
            .unwrap();
        assert_eq!(status.state, LifecycleState::Crashed);
    }
}
