use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use mediabridge_frame::{CloseReason, FramedChannel};
use mediabridge_process::{EngineProcess, ExitInfo, ProcessStatus};
use mediabridge_rpc::{Multiplexer, RpcError};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dump::EngineDump;
use crate::error::{decode, Result, SessionError};
use crate::handle::{lock, Liveness};
use crate::handler::{Handler, HandlerOptions, WeakHandler};
use crate::methods;
use crate::source::{AcquiredSource, MediaSource, MediaSourceSpec};

/// Deadline for the engine to acknowledge `close` before it is terminated.
const CLOSE_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Remote rejection reason for media origins the engine cannot open.
const UNSUPPORTED_SOURCE_REASON: &str = "UnsupportedSource";

/// SCTP stream counts advertised for every handler.
const SCTP_NUM_STREAMS: u16 = 1024;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedHandler {
    handler_id: String,
}

struct EngineInner {
    mux: Multiplexer,
    process: Option<EngineProcess>,
    liveness: Liveness,
    handlers: Mutex<Vec<WeakHandler>>,
    watcher: Mutex<Option<AbortHandle>>,
    config: EngineConfig,
}

impl EngineInner {
    /// Mark the engine and everything it created as closed. Returns whether
    /// this call did it.
    fn close_local(&self) -> bool {
        if !self.liveness.close() {
            return false;
        }
        let handlers = std::mem::take(&mut *lock(&self.handlers));
        for handler in &handlers {
            handler.close_local();
        }
        true
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

/// Controller for one media engine.
///
/// Every call goes over a single control channel. Closing the engine closes
/// every handler, source and handle created through it. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Launch the engine process described by `config`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: EngineConfig) -> Result<Self> {
        let (process, inbound) = EngineProcess::spawn(&config.spawn_config())?;
        let mux = Multiplexer::start(process.channel().clone(), inbound, config.rpc_config());
        info!(
            pid = process.pid(),
            program = %config.program.display(),
            "engine started"
        );
        Ok(Self::from_parts(mux, Some(process), config))
    }

    /// Drive an engine that is already running behind `reader`/`writer`.
    ///
    /// No process is supervised; the engine is considered gone when the
    /// channel closes. Must be called from within a Tokio runtime.
    pub fn attach<R, W>(reader: R, writer: W, config: EngineConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (channel, inbound) = FramedChannel::open(reader, writer, config.frame_config());
        let mux = Multiplexer::start(channel, inbound, config.rpc_config());
        debug!("engine attached");
        Self::from_parts(mux, None, config)
    }

    fn from_parts(mux: Multiplexer, process: Option<EngineProcess>, config: EngineConfig) -> Self {
        let inner = Arc::new(EngineInner {
            mux,
            process,
            liveness: Liveness::default(),
            handlers: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
            config,
        });

        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        let mux = inner.mux.clone();
        let task = tokio::spawn(async move {
            let reason = mux.closed().await;
            drop(mux);
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.close_local() {
                match reason {
                    CloseReason::Explicit => debug!("engine channel closed"),
                    reason => warn!(%reason, "engine channel lost"),
                }
            }
        });
        *lock(&inner.watcher) = Some(task.abort_handle());

        Self { inner }
    }

    /// Engine process id, when the engine was spawned by this controller.
    pub fn pid(&self) -> Option<u32> {
        self.inner.process.as_ref().map(EngineProcess::pid)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.liveness.is_closed()
    }

    /// Lifecycle updates of the supervised process.
    pub fn lifecycle(&self) -> Option<watch::Receiver<ProcessStatus>> {
        self.inner.process.as_ref().map(EngineProcess::subscribe)
    }

    /// Resolves when the engine is gone. Carries the exit details if a
    /// spawned engine died without being closed; `None` otherwise.
    pub async fn died(&self) -> Option<ExitInfo> {
        match &self.inner.process {
            Some(process) => process.died().await,
            None => {
                self.inner.mux.closed().await;
                None
            }
        }
    }

    /// Underlying call multiplexer, for calls with a custom deadline.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.mux
    }

    fn ensure_open(&self) -> Result<()> {
        self.inner.liveness.ensure_open("engine")
    }

    /// Snapshot of the engine's sources and sessions.
    pub async fn dump(&self) -> Result<EngineDump> {
        self.ensure_open()?;
        let value = self
            .inner
            .mux
            .request(methods::DUMP, None, json!({}))
            .await?;
        decode(methods::DUMP, value)
    }

    /// Open a media source in the engine.
    ///
    /// Unknown origins are rejected locally; origins the engine cannot open
    /// are reported as [`SessionError::UnsupportedSource`] too.
    pub async fn acquire_media_source(&self, spec: &MediaSourceSpec) -> Result<MediaSource> {
        self.ensure_open()?;
        spec.validate()?;

        let data = serde_json::to_value(spec)?;
        let value = match self
            .inner
            .mux
            .request(methods::GET_USER_MEDIA, None, data)
            .await
        {
            Ok(value) => value,
            Err(RpcError::Remote { reason, detail, .. }) if reason == UNSUPPORTED_SOURCE_REASON => {
                return Err(SessionError::UnsupportedSource(detail.unwrap_or(reason)));
            }
            Err(err) => return Err(err.into()),
        };
        let acquired: AcquiredSource = decode(methods::GET_USER_MEDIA, value)?;
        self.ensure_open()?;

        let source = MediaSource::new(self.inner.mux.clone(), &self.inner.liveness, acquired);
        debug!(source_id = source.id(), tracks = source.tracks().len(), "media source acquired");
        Ok(source)
    }

    pub fn create_handler_factory(&self) -> Result<HandlerFactory> {
        self.ensure_open()?;
        Ok(HandlerFactory {
            engine: self.clone(),
        })
    }

    fn register(&self, handler: &Handler) {
        let mut handlers = lock(&self.inner.handlers);
        handlers.retain(|handler| !handler.is_gone());
        handlers.push(handler.downgrade());
    }

    /// Close the engine: handlers and handles first, then the engine itself.
    ///
    /// The engine is asked to exit, the channel is closed and a spawned
    /// process is terminated if it does not exit within the grace period.
    /// Idempotent.
    pub async fn close(&self) {
        let inner = &self.inner;
        let first = inner.close_local();

        if let Some(process) = &inner.process {
            process.expect_exit();
        }
        if first && !inner.mux.is_closed() {
            if let Err(err) = inner
                .mux
                .call(methods::CLOSE, None, json!({}), Some(CLOSE_ACK_TIMEOUT))
                .await
            {
                debug!(error = %err, "engine close not acknowledged");
            }
        }
        inner.mux.close().await;

        if let Some(process) = &inner.process {
            match process.shutdown().await {
                Ok(status) if first => info!(pid = process.pid(), state = %status.state, "engine closed"),
                Ok(_) => {}
                Err(err) => warn!(pid = process.pid(), error = %err, "engine shutdown failed"),
            }
        } else if first {
            info!("engine closed");
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("pid", &self.pid())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates handlers and reports what the engine can negotiate.
#[derive(Debug, Clone)]
pub struct HandlerFactory {
    engine: Engine,
}

impl HandlerFactory {
    /// Create a send or receive handler in the engine.
    pub async fn create_handler(&self, options: HandlerOptions) -> Result<Handler> {
        self.engine.ensure_open()?;
        let data = serde_json::to_value(&options)?;
        let value = self
            .engine
            .inner
            .mux
            .request(methods::CREATE_HANDLER, None, data)
            .await?;
        let created: CreatedHandler = decode(methods::CREATE_HANDLER, value)?;
        self.engine.ensure_open()?;

        let handler = Handler::new(
            self.engine.inner.mux.clone(),
            &self.engine.inner.liveness,
            created.handler_id,
            options.direction,
        );
        self.engine.register(&handler);
        Ok(handler)
    }

    /// RTP capabilities of the engine, as reported by it.
    pub async fn native_rtp_capabilities(&self) -> Result<Value> {
        self.engine.ensure_open()?;
        Ok(self
            .engine
            .inner
            .mux
            .request(methods::GET_RTP_CAPABILITIES, None, json!({}))
            .await?)
    }

    pub fn native_sctp_capabilities(&self) -> Value {
        json!({
            "numStreams": { "OS": SCTP_NUM_STREAMS, "MIS": SCTP_NUM_STREAMS }
        })
    }
}
