//! Single writer task and per-write completions
//!
//! Every outbound frame is encoded by the connection core and queued here in
//! order. The writer task owns the write half of the transport and resolves
//! exactly one [`WriteOutcome`] per request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use pin_project_lite::pin_project;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc, oneshot};

use crate::error::{Error, Result};

/// How a queued write ended
#[derive(Debug)]
pub enum WriteOutcome {
    /// Bytes reached the transport
    Completed,
    /// Dropped before being written (connection closed or aborted)
    Cancelled,
    /// The transport write failed
    Failed(Error),
}

impl WriteOutcome {
    /// Whether the write completed
    #[inline]
    pub fn is_completed(&self) -> bool {
        matches!(self, WriteOutcome::Completed)
    }

    /// `Ok` for a completed write; cancellation maps to `ConnectionClosed`
    pub fn into_result(self) -> Result<()> {
        match self {
            WriteOutcome::Completed => Ok(()),
            WriteOutcome::Cancelled => Err(Error::ConnectionClosed),
            WriteOutcome::Failed(err) => Err(err),
        }
    }
}

pin_project! {
    /// Resolves once the writer task is done with one request
    ///
    /// Dropping it does not cancel the write.
    #[must_use = "dropping a WriteFuture ignores whether the write succeeded"]
    pub struct WriteFuture {
        ready: Option<WriteOutcome>,
        #[pin]
        rx: Option<oneshot::Receiver<WriteOutcome>>,
    }
}

impl WriteFuture {
    pub(crate) fn pending(rx: oneshot::Receiver<WriteOutcome>) -> Self {
        Self {
            ready: None,
            rx: Some(rx),
        }
    }

    pub(crate) fn ready(outcome: WriteOutcome) -> Self {
        Self {
            ready: Some(outcome),
            rx: None,
        }
    }
}

impl Future for WriteFuture {
    type Output = WriteOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<WriteOutcome> {
        let this = self.project();
        if let Some(outcome) = this.ready.take() {
            return Poll::Ready(outcome);
        }
        match this.rx.as_pin_mut() {
            // A dropped sender means the writer went away first
            Some(rx) => rx.poll(cx).map(|res| res.unwrap_or(WriteOutcome::Cancelled)),
            None => Poll::Ready(WriteOutcome::Cancelled),
        }
    }
}

impl std::fmt::Debug for WriteFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteFuture")
            .field("ready", &self.ready.is_some())
            .finish()
    }
}

/// One encoded frame waiting for the transport
pub(crate) struct WriteRequest {
    bytes: Bytes,
    /// Marks our close frame, whose completion the close handshake waits on
    is_close: bool,
    done: oneshot::Sender<WriteOutcome>,
}

impl WriteRequest {
    pub fn new(bytes: Bytes, is_close: bool) -> (Self, WriteFuture) {
        let (done, rx) = oneshot::channel();
        (
            Self {
                bytes,
                is_close,
                done,
            },
            WriteFuture::pending(rx),
        )
    }

    fn complete(self, outcome: WriteOutcome) {
        // Nobody waiting is fine
        let _ = self.done.send(outcome);
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    io.write_all(bytes).await?;
    io.flush().await
}

/// Drain the queue into `io` until stopped, the queue closes or a write fails
///
/// `on_close_written` runs after a close frame reached the transport. Returns
/// the failure that ended the task, if any. Requests still queued at the end
/// are cancelled and the write half is shut down.
pub(crate) async fn run_writer<W, F>(
    mut io: W,
    mut rx: mpsc::Receiver<WriteRequest>,
    stop: Arc<Notify>,
    mut on_close_written: F,
) -> Option<Error>
where
    W: AsyncWrite + Unpin,
    F: FnMut(),
{
    let mut failure = None;

    loop {
        let request = tokio::select! {
            biased;
            _ = stop.notified() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let written = tokio::select! {
            biased;
            _ = stop.notified() => None,
            result = write_frame(&mut io, &request.bytes) => Some(result),
        };

        match written {
            None => {
                request.complete(WriteOutcome::Cancelled);
                break;
            }
            Some(Ok(())) => {
                if request.is_close {
                    on_close_written();
                }
                request.complete(WriteOutcome::Completed);
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "transport write failed");
                let err = Arc::new(Error::Io(err));
                request.complete(WriteOutcome::Failed(Error::Shared(err.clone())));
                failure = Some(Error::Shared(err));
                break;
            }
        }
    }

    rx.close();
    let mut cancelled = 0usize;
    while let Ok(request) = rx.try_recv() {
        request.complete(WriteOutcome::Cancelled);
        cancelled += 1;
    }
    if cancelled > 0 {
        tracing::trace!(cancelled, "cancelled queued writes");
    }

    if let Err(err) = io.shutdown().await {
        tracing::trace!(error = %err, "transport shutdown failed");
    }
    failure
}
