use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::codec::{FrameConfig, MessageCodec};
use crate::error::{FrameError, Result};
use crate::kind::kind_name;
use crate::message::Message;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a channel stopped. Recorded exactly once per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called by the owner.
    Explicit,
    /// The peer closed its write side on a record boundary.
    EndOfStream,
    /// The byte stream could not be parsed (bad magic, unknown kind, bad JSON, ...).
    ProtocolFault(String),
    /// The pipe broke or ended in the middle of a record.
    TransportFault(String),
}

impl CloseReason {
    /// True for every reason except an owner-initiated close.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, CloseReason::Explicit)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Explicit => write!(f, "closed by owner"),
            CloseReason::EndOfStream => write!(f, "end of stream"),
            CloseReason::ProtocolFault(detail) => write!(f, "protocol fault: {detail}"),
            CloseReason::TransportFault(detail) => write!(f, "transport fault: {detail}"),
        }
    }
}

struct CloseState {
    tx: watch::Sender<Option<CloseReason>>,
}

impl CloseState {
    /// Record `reason` if nothing was recorded yet. Returns whether it won.
    fn finish(&self, reason: CloseReason) -> bool {
        let mut won = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.clone());
                won = true;
            }
            won
        });
        if won {
            match &reason {
                CloseReason::ProtocolFault(_) | CloseReason::TransportFault(_) => {
                    warn!(%reason, "control channel terminated");
                }
                _ => debug!(%reason, "control channel closed"),
            }
        }
        won
    }

    async fn wait(&self) -> CloseReason {
        let mut rx = self.tx.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(CloseReason::Explicit)
    }
}

struct Shared {
    writer: Mutex<Option<FramedWrite<BoxedWriter, MessageCodec>>>,
    close: Arc<CloseState>,
    reader: AbortHandle,
}

/// Bidirectional message channel over a pair of byte streams.
///
/// Writes are serialized: each [`send`](Self::send) encodes one whole record and
/// writes it while holding the write half, so concurrent callers never
/// interleave bytes. Reads happen on a background task that yields messages to
/// the paired [`Inbound`] strictly in arrival order.
#[derive(Clone)]
pub struct FramedChannel {
    shared: Arc<Shared>,
}

/// Receiving side of a [`FramedChannel`]. Ends once the channel closes.
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Message>,
}

impl FramedChannel {
    /// Attach a reader and a writer and start the read loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open<R, W>(reader: R, writer: W, config: FrameConfig) -> (Self, Inbound)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (close_tx, _) = watch::channel(None);
        let close = Arc::new(CloseState { tx: close_tx });
        let (tx, rx) = mpsc::unbounded_channel();

        let framed_read = FramedRead::new(reader, MessageCodec::new(config.clone()));
        let task = tokio::spawn(read_loop(framed_read, tx, Arc::clone(&close)));

        let boxed: BoxedWriter = Box::new(writer);
        let shared = Arc::new(Shared {
            writer: Mutex::new(Some(FramedWrite::new(boxed, MessageCodec::new(config)))),
            close,
            reader: task.abort_handle(),
        });

        (Self { shared }, Inbound { rx })
    }

    /// Encode and write one message, then flush.
    ///
    /// Encoding failures (oversized payload) fail this call only. I/O failures
    /// terminate the channel. A pending send, including one stuck on a full
    /// pipe, fails with [`FrameError::ConnectionClosed`] as soon as the channel
    /// closes.
    ///
    /// Dropping the returned future mid-write leaves the unwritten bytes
    /// buffered in the writer; the next send flushes them before its own
    /// record, so the byte stream stays aligned on record boundaries.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(FrameError::ConnectionClosed);
        }

        let kind = message.kind();
        let mut guard = tokio::select! {
            guard = self.shared.writer.lock() => guard,
            _ = self.shared.close.wait() => return Err(FrameError::ConnectionClosed),
        };
        let writer = guard.as_mut().ok_or(FrameError::ConnectionClosed)?;

        let written = tokio::select! {
            result = writer.send(message) => Some(result),
            _ = self.shared.close.wait() => None,
        };
        let Some(written) = written else {
            // Closed while blocked on the pipe; the record may be half written.
            guard.take();
            debug!(kind = kind_name(kind), "write abandoned on close");
            return Err(FrameError::ConnectionClosed);
        };

        match written {
            Ok(()) => {
                trace!(kind = kind_name(kind), "frame written");
                Ok(())
            }
            Err(FrameError::Io(err)) => {
                self.shared
                    .close
                    .finish(CloseReason::TransportFault(err.to_string()));
                guard.take();
                Err(FrameError::Io(err))
            }
            Err(err) => Err(err),
        }
    }

    /// Close the channel. Idempotent; the first recorded reason wins.
    pub async fn close(&self) {
        self.shared.close.finish(CloseReason::Explicit);
        self.shared.reader.abort();

        let writer = self.shared.writer.lock().await.take();
        if let Some(writer) = writer {
            let mut inner = writer.into_inner();
            if let Err(err) = inner.shutdown().await {
                debug!(error = %err, "write half shutdown failed");
            }
        }
    }

    /// Wait until the channel has closed and return why.
    pub async fn closed(&self) -> CloseReason {
        self.shared.close.wait().await
    }

    /// The close reason, if the channel has closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close.tx.borrow().clone()
    }

    /// Whether the channel has closed for any reason.
    pub fn is_closed(&self) -> bool {
        self.shared.close.tx.borrow().is_some()
    }
}

impl fmt::Debug for FramedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedChannel")
            .field("close_reason", &self.close_reason())
            .finish()
    }
}

impl Inbound {
    /// Next message in arrival order, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }
}

impl futures_core::Stream for Inbound {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound").finish_non_exhaustive()
    }
}

async fn read_loop<R>(
    mut framed: FramedRead<R, MessageCodec>,
    tx: mpsc::UnboundedSender<Message>,
    close: Arc<CloseState>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match framed.next().await {
            Some(Ok(message)) => {
                trace!(kind = kind_name(message.kind()), "frame received");
                // A dropped Inbound only means nobody listens anymore.
                let _ = tx.send(message);
            }
            Some(Err(err)) if err.is_protocol_fault() => {
                break CloseReason::ProtocolFault(err.to_string());
            }
            Some(Err(err)) => break CloseReason::TransportFault(err.to_string()),
            None => break CloseReason::EndOfStream,
        }
    };
    // Record the reason before `tx` drops so Inbound consumers see it on `None`.
    close.finish(reason);
}
