use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mediabridge_frame::{
    CloseReason, FrameError, FramedChannel, Inbound, Message, Notification, Request, Response,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::error::{Result, RpcError};
use crate::subscription::{self, lock, ListenerTable, Subscription};

/// Default deadline for a call when none is given.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Deadline applied by [`Multiplexer::request`].
    pub default_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl RpcConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

struct PendingCall {
    method: String,
    created_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct PendingTable {
    calls: BTreeMap<u64, PendingCall>,
    closed: bool,
}

struct State {
    pending: Mutex<PendingTable>,
    listeners: Arc<Mutex<ListenerTable>>,
}

impl State {
    fn settle(&self, response: Response) {
        let Some(call) = lock(&self.pending).calls.remove(&response.id) else {
            debug!(id = response.id, "response for unknown id discarded");
            return;
        };

        trace!(
            id = response.id,
            method = %call.method,
            ok = response.ok,
            elapsed = ?call.created_at.elapsed(),
            "call settled"
        );
        let method = call.method;
        let result = response.into_result().map_err(|err| RpcError::Remote {
            method,
            reason: err.reason,
            detail: err.detail,
        });
        // The caller may have given up already.
        let _ = call.slot.send(result);
    }

    fn notify(&self, notification: Notification) {
        let listeners =
            lock(&self.listeners).listeners(&notification.target_id, &notification.event);
        if listeners.is_empty() {
            trace!(
                target_id = %notification.target_id,
                event = %notification.event,
                "notification without listener dropped"
            );
            return;
        }
        for listener in listeners {
            listener(&notification.data);
        }
    }

    /// Settle every outstanding call with `ChannelClosed`, lowest id first, and
    /// refuse new ones.
    fn fail_all(&self, reason: &CloseReason) {
        let calls = {
            let mut pending = lock(&self.pending);
            pending.closed = true;
            std::mem::take(&mut pending.calls)
        };
        if !calls.is_empty() {
            debug!(count = calls.len(), %reason, "failing pending calls");
        }
        for (_, call) in calls {
            let _ = call.slot.send(Err(RpcError::ChannelClosed));
        }
        lock(&self.listeners).clear();
    }

    fn forget(&self, id: u64) {
        lock(&self.pending).calls.remove(&id);
    }
}

/// Removes a call from the table when the caller stops waiting for it, whether
/// it returned, timed out, or its future was dropped.
struct PendingGuard<'a> {
    state: &'a State,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.forget(self.id);
    }
}

struct Inner {
    channel: FramedChannel,
    state: Arc<State>,
    next_id: AtomicU64,
    config: RpcConfig,
    dispatcher: AbortHandle,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Correlates requests and responses over one [`FramedChannel`].
///
/// Cheap to clone; all clones share the same pending-call table, listener
/// table and id counter.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl Multiplexer {
    /// Take over `inbound` and start dispatching.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(channel: FramedChannel, inbound: Inbound, config: RpcConfig) -> Self {
        let state = Arc::new(State {
            pending: Mutex::new(PendingTable::default()),
            listeners: Arc::new(Mutex::new(ListenerTable::default())),
        });
        let task = tokio::spawn(dispatch(inbound, channel.clone(), Arc::clone(&state)));

        Self {
            inner: Arc::new(Inner {
                channel,
                state,
                next_id: AtomicU64::new(1),
                config,
                dispatcher: task.abort_handle(),
            }),
        }
    }

    /// Issue a call with the default timeout.
    pub async fn request(&self, method: &str, target: Option<&str>, data: Value) -> Result<Value> {
        self.call(method, target, data, None).await
    }

    /// Issue a call and wait for its settlement.
    ///
    /// The deadline covers both writing the request and waiting for the
    /// response, so a peer that stops draining its input cannot hold the
    /// caller past `timeout`. A timeout abandons the call locally; the engine
    /// is not told and may still act on it. A response that arrives later is
    /// discarded.
    pub async fn call(
        &self,
        method: &str,
        target: Option<&str>,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let (id, rx) = self.register(method)?;
        let _guard = PendingGuard {
            state: &self.inner.state,
            id,
        };

        let request = Request {
            id,
            method: method.to_string(),
            target_id: target.map(str::to_string),
            data,
        };
        let exchange = async {
            trace!(id, method, target_id = ?target, "sending request");
            self.inner
                .channel
                .send(request.into())
                .await
                .map_err(|err| match err {
                    FrameError::ConnectionClosed => RpcError::ChannelClosed,
                    other => RpcError::Frame(other),
                })?;
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(RpcError::ChannelClosed),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                debug!(id, method, ?timeout, "request timed out");
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    fn register(&self, method: &str) -> Result<(u64, oneshot::Receiver<Result<Value>>)> {
        let mut pending = lock(&self.inner.state.pending);
        if pending.closed || self.inner.channel.is_closed() {
            return Err(RpcError::ChannelClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.calls.insert(
            id,
            PendingCall {
                method: method.to_string(),
                created_at: Instant::now(),
                slot: tx,
            },
        );
        Ok((id, rx))
    }

    /// Invoke `listener` for every `event` notification addressed to `target`.
    ///
    /// Listeners run on the dispatch task in arrival order and must not block.
    pub fn subscribe<F>(&self, target: &str, event: &str, listener: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        subscription::register(&self.inner.state.listeners, target, event, Arc::new(listener))
    }

    /// Remove every listener registered for `target`.
    pub fn unsubscribe_target(&self, target: &str) {
        let removed = lock(&self.inner.state.listeners).remove_target(target);
        if removed > 0 {
            debug!(target_id = target, removed, "listeners removed");
        }
    }

    /// Close the channel and fail every pending call with `ChannelClosed`.
    /// Idempotent.
    pub async fn close(&self) {
        self.inner.channel.close().await;
        self.inner.state.fail_all(&CloseReason::Explicit);
    }

    /// Wait until the underlying channel has closed.
    pub async fn closed(&self) -> CloseReason {
        self.inner.channel.closed().await
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state.pending).closed || self.inner.channel.is_closed()
    }

    /// Number of calls waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.state.pending).calls.len()
    }

    pub fn channel(&self) -> &FramedChannel {
        &self.inner.channel
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn dispatch(mut inbound: Inbound, channel: FramedChannel, state: Arc<State>) {
    while let Some(message) = inbound.recv().await {
        match message {
            Message::Response(response) => state.settle(response),
            Message::Notification(notification) => state.notify(notification),
            Message::Request(request) => {
                warn!(
                    id = request.id,
                    method = %request.method,
                    "engine sent a request, dropping"
                );
            }
        }
    }
    let reason = channel.closed().await;
    state.fail_all(&reason);
}
