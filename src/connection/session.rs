//! Connection driver: read loop, close handshake and timers

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep_until};
use uuid::Uuid;

use super::Handler;
use super::protocol::{ConnectionCore, Event, Inbound};
use super::state::ConnectionState;
use super::writer::{WriteFuture, WriteOutcome, WriteRequest, run_writer};
use crate::error::{CloseCode, CloseReason, Error, ProtocolError, Result};
use crate::extension::ExtensionPipeline;
use crate::frame::OpCode;
use crate::handshake::{HandshakeVariant, Upgraded};
use crate::mask::MaskGenerator;
use crate::{Config, RECV_BUFFER_SIZE, Role};

/// State shared by the read loop, the writer task and every handle
struct Shared {
    id: Uuid,
    role: Role,
    subprotocol: Option<String>,
    target: String,
    core: Mutex<ConnectionCore>,
    tx: mpsc::Sender<WriteRequest>,
    /// Wakes the read loop after a local close, an abort or a flushed close frame
    wake: Notify,
    stop_writer: Arc<Notify>,
    aborted: AtomicBool,
}

/// Cloneable handle for sending on, inspecting and closing a connection
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    /// Unique id of the connection
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Local role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state()
    }

    /// Whether application data can still be sent
    pub fn is_open(&self) -> bool {
        self.state().can_send() && !self.shared.aborted.load(Ordering::Acquire)
    }

    /// Negotiated subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.shared.subprotocol.as_deref()
    }

    /// Request target of the upgrade
    pub fn target(&self) -> &str {
        &self.shared.target
    }

    /// Names of the active extensions, in negotiation order
    pub fn extensions(&self) -> Vec<String> {
        self.shared.core.lock().extension_names()
    }

    /// Encode under the connection lock and queue in the same critical section
    ///
    /// Waiting for queue capacity happens before the lock is taken, so frames
    /// reach the writer in exactly the order they were encoded.
    async fn submit<F>(&self, is_close: bool, encode: F) -> Result<WriteFuture>
    where
        F: FnOnce(&mut ConnectionCore) -> Result<Option<Bytes>>,
    {
        if self.shared.aborted.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let permit = self
            .shared
            .tx
            .reserve()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        let future = {
            let mut core = self.shared.core.lock();
            match encode(&mut core)? {
                Some(bytes) => {
                    let (request, future) = WriteRequest::new(bytes, is_close);
                    permit.send(request);
                    future
                }
                None => WriteFuture::ready(WriteOutcome::Completed),
            }
        };

        if is_close {
            self.shared.wake.notify_one();
        }
        Ok(future)
    }

    /// Send a text message
    pub async fn send_text(&self, text: impl Into<String>) -> Result<WriteFuture> {
        let payload = Bytes::from(text.into());
        self.submit(false, |core| core.encode_message(OpCode::Text, payload).map(Some))
            .await
    }

    /// Send a binary message
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<WriteFuture> {
        let payload = data.into();
        self.submit(false, |core| core.encode_message(OpCode::Binary, payload).map(Some))
            .await
    }

    /// Send one piece of a streamed text message
    pub async fn send_text_fragment(&self, text: &str, last: bool) -> Result<WriteFuture> {
        let payload = Bytes::copy_from_slice(text.as_bytes());
        self.submit(false, |core| {
            core.encode_fragment(OpCode::Text, payload, last).map(Some)
        })
        .await
    }

    /// Send one piece of a streamed binary message
    pub async fn send_binary_fragment(
        &self,
        data: impl Into<Bytes>,
        last: bool,
    ) -> Result<WriteFuture> {
        let payload = data.into();
        self.submit(false, |core| {
            core.encode_fragment(OpCode::Binary, payload, last).map(Some)
        })
        .await
    }

    /// Send a ping (at most 125 bytes)
    pub async fn ping(&self, data: impl Into<Bytes>) -> Result<WriteFuture> {
        let payload = data.into();
        self.submit(false, |core| core.encode_control(OpCode::Ping, payload).map(Some))
            .await
    }

    /// Send an unsolicited pong (at most 125 bytes)
    pub async fn pong(&self, data: impl Into<Bytes>) -> Result<WriteFuture> {
        let payload = data.into();
        self.submit(false, |core| core.encode_control(OpCode::Pong, payload).map(Some))
            .await
    }

    /// Start the close handshake
    ///
    /// Codes that may not go on the wire are sent as 1000, while `on_close`
    /// still reports `reason`. Closing twice is a no-op.
    pub async fn close(&self, reason: CloseReason) -> Result<WriteFuture> {
        self.submit(true, |core| core.encode_close(reason)).await
    }

    /// Drop the connection without a close handshake
    ///
    /// Queued writes are cancelled and `on_close` reports 1006.
    pub fn abort(&self) {
        if !self.shared.aborted.swap(true, Ordering::AcqRel) {
            tracing::debug!(id = %self.shared.id, "connection aborted");
            self.shared.stop_writer.notify_one();
            self.shared.wake.notify_one();
        }
    }
}

/// An upgraded connection, ready to [`run`](Connection::run)
pub struct Connection<S, H> {
    stream: S,
    handler: H,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<WriteRequest>,
    leftover: Bytes,
    config: Config,
}

impl<S, H> fmt::Debug for Connection<S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("config", &self.config)
            .finish()
    }
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    /// Wrap a stream whose handshake completed
    pub fn new(stream: S, role: Role, upgraded: Upgraded, config: Config, handler: H) -> Self {
        let Upgraded {
            params,
            extensions,
            target,
            leftover,
        } = upgraded;
        Self::build(
            stream,
            role,
            params.variant,
            extensions,
            params.subprotocol,
            target,
            leftover,
            config,
            handler,
        )
    }

    /// Wrap a stream that already speaks RFC 6455 frames, with no extensions
    pub fn from_raw(stream: S, role: Role, config: Config, handler: H) -> Self {
        Self::build(
            stream,
            role,
            HandshakeVariant::Rfc6455,
            ExtensionPipeline::new(),
            None,
            "/".to_string(),
            Bytes::new(),
            config,
            handler,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        stream: S,
        role: Role,
        variant: HandshakeVariant,
        extensions: ExtensionPipeline,
        subprotocol: Option<String>,
        target: String,
        leftover: Bytes,
        config: Config,
        handler: H,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.write_queue_capacity.max(1));
        let core = ConnectionCore::new(role, variant, extensions, &config);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            role,
            subprotocol,
            target,
            core: Mutex::new(core),
            tx,
            wake: Notify::new(),
            stop_writer: Arc::new(Notify::new()),
            aborted: AtomicBool::new(false),
        });
        Self {
            stream,
            handler,
            shared,
            rx,
            leftover,
            config,
        }
    }

    /// Use a custom masking key source (client connections)
    pub fn with_mask_generator(self, masks: Arc<dyn MaskGenerator>) -> Self {
        self.shared.core.lock().set_mask_generator(masks);
        self
    }

    /// Handle usable before and while the connection runs
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Connection id
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Drive the connection until it is closed
    ///
    /// Calls `on_open`, dispatches every inbound message to the handler and
    /// finishes with exactly one `on_close`, whose reason is also returned.
    pub async fn run(self) -> CloseReason {
        let Connection {
            stream,
            handler,
            shared,
            rx,
            leftover,
            config,
        } = self;
        let handle = ConnectionHandle {
            shared: shared.clone(),
        };

        let (mut reader, writer) = tokio::io::split(stream);
        let flushed = shared.clone();
        let on_close_written = move || {
            flushed.core.lock().mark_close_flushed();
            flushed.wake.notify_one();
        };
        let mut writer_task = tokio::spawn(run_writer(
            writer,
            rx,
            shared.stop_writer.clone(),
            on_close_written,
        ));

        shared.core.lock().open();
        tracing::debug!(
            id = %shared.id,
            role = ?shared.role,
            target = %shared.target,
            "connection open"
        );

        if let Err(err) = handler.on_open(&handle).await {
            let err = Error::Handler(err);
            handler.on_error(&handle, &err).await;
            let reason = CloseReason::new(CloseCode::InternalError, "");
            if let Err(close_err) = handle.close(reason).await {
                tracing::debug!(error = %close_err, "could not send close after on_open failure");
            }
        }

        let mut buf = BytesMut::with_capacity(RECV_BUFFER_SIZE);
        buf.extend_from_slice(&leftover);

        let mut eof = false;
        let mut failed = false;
        let mut writer_done = false;
        let mut last_read = Instant::now();
        let mut closing_since: Option<Instant> = None;
        let mut outbox: Option<Reply> = None;

        let reason = loop {
            if !failed {
                if let Err(err) = drain_frames(&mut buf, &handle, &handler, &mut outbox).await {
                    tracing::debug!(id = %shared.id, error = %err, "protocol violation");
                    handler.on_error(&handle, &err).await;
                    let close = shared.core.lock().fail(&err);
                    if let Some(bytes) = close {
                        stage_reply(&mut outbox, Reply::close(bytes));
                    }
                    failed = true;
                    buf.clear();
                }
            }
            try_flush(&shared.tx, &mut outbox);

            if shared.aborted.load(Ordering::Acquire) {
                break CloseReason::abnormal("connection aborted");
            }

            let (state, close_sent, close_received, close_flushed, first) = {
                let core = shared.core.lock();
                (
                    core.state(),
                    core.close_sent(),
                    core.close_received(),
                    core.close_flushed(),
                    core.first_close(),
                )
            };
            if close_flushed && (close_received || eof || failed) {
                break first.unwrap_or_else(CloseReason::normal);
            }
            if eof && !close_sent {
                tracing::debug!(id = %shared.id, "transport closed without a close frame");
                break CloseReason::abnormal("connection dropped");
            }

            let now = Instant::now();
            let idle_deadline = match state {
                ConnectionState::Open => config.idle_timeout.map(|timeout| last_read + timeout),
                _ => None,
            };
            if state == ConnectionState::Closing && closing_since.is_none() {
                closing_since = Some(now);
            }
            let close_deadline = closing_since.map(|since| since + config.close_timeout);

            buf.reserve(4096);
            tokio::select! {
                read = reader.read_buf(&mut buf), if !eof && !failed => match read {
                    Ok(0) => eof = true,
                    Ok(n) => {
                        tracing::trace!(id = %shared.id, bytes = n, "read");
                        last_read = Instant::now();
                    }
                    Err(err) => {
                        let err = Error::Io(err);
                        handler.on_error(&handle, &err).await;
                        eof = true;
                    }
                },
                permit = shared.tx.reserve(), if outbox.is_some() => {
                    if let (Ok(permit), Some(reply)) = (permit, outbox.take()) {
                        permit.send(reply.into_request());
                    }
                }
                _ = shared.wake.notified() => {}
                _ = sleep_until(idle_deadline.unwrap_or(now)), if idle_deadline.is_some() => {
                    tracing::debug!(id = %shared.id, "idle timeout");
                    let reason = CloseReason::new(CloseCode::GoingAway, "idle timeout");
                    let close = shared.core.lock().encode_close(reason);
                    match close {
                        Ok(Some(bytes)) => stage_reply(&mut outbox, Reply::close(bytes)),
                        Ok(None) => {}
                        Err(err) => tracing::trace!(error = %err, "idle close not queued"),
                    }
                }
                _ = sleep_until(close_deadline.unwrap_or(now)), if close_deadline.is_some() => {
                    let err = Error::Protocol(ProtocolError::CloseTimeout);
                    tracing::debug!(id = %shared.id, error = %err, "close handshake timed out");
                    break CloseReason::abnormal(err.to_string());
                }
                joined = &mut writer_task, if !writer_done => {
                    writer_done = true;
                    let cause = match joined {
                        Ok(Some(err)) => err.to_string(),
                        Ok(None) => "writer stopped".to_string(),
                        Err(err) => err.to_string(),
                    };
                    tracing::debug!(id = %shared.id, cause = %cause, "writer finished early");
                    break CloseReason::abnormal(cause);
                }
            }
        };

        shared.stop_writer.notify_one();
        if !writer_done {
            if let Err(err) = writer_task.await {
                tracing::warn!(id = %shared.id, error = %err, "writer task panicked");
            }
        }
        shared.core.lock().mark_closed();
        tracing::debug!(
            id = %shared.id,
            code = %reason.code,
            reason = %reason.reason,
            "connection closed"
        );

        if let Err(err) = handler.on_close(&handle, reason.clone()).await {
            tracing::warn!(id = %shared.id, error = %err, "on_close failed");
        }
        reason
    }
}

/// Automatic pong or close frame waiting for room in the write queue
///
/// The read loop holds at most one, so a full queue never stops it reading.
struct Reply {
    bytes: Bytes,
    is_close: bool,
}

impl Reply {
    fn close(bytes: Bytes) -> Self {
        Self {
            bytes,
            is_close: true,
        }
    }

    fn into_request(self) -> WriteRequest {
        let (request, _completion) = WriteRequest::new(self.bytes, self.is_close);
        request
    }
}

/// Hold `reply`, replacing an older pong but never our close frame
fn stage_reply(outbox: &mut Option<Reply>, reply: Reply) {
    if !outbox.as_ref().is_some_and(|held| held.is_close) {
        *outbox = Some(reply);
    }
}

/// Queue the held reply if the writer has room right now
fn try_flush(tx: &mpsc::Sender<WriteRequest>, outbox: &mut Option<Reply>) {
    let Some(reply) = outbox.take() else {
        return;
    };
    match tx.try_reserve() {
        Ok(permit) => permit.send(reply.into_request()),
        Err(TrySendError::Full(())) => *outbox = Some(reply),
        // Writer is gone; the run loop reports it
        Err(TrySendError::Closed(())) => {}
    }
}

/// Decode and dispatch every complete frame in `buf`
///
/// Automatic replies go to `outbox`. An `Err` is a protocol violation that
/// fails the connection.
async fn drain_frames<H: Handler>(
    buf: &mut BytesMut,
    handle: &ConnectionHandle,
    handler: &H,
    outbox: &mut Option<Reply>,
) -> Result<()> {
    let shared = &handle.shared;
    loop {
        let decoded = shared.core.lock().decode(buf)?;
        let Some((frame, used)) = decoded else {
            return Ok(());
        };
        buf.advance(used);

        let Inbound {
            event,
            reply,
            reply_is_close,
        } = shared.core.lock().on_frame(frame)?;
        if let Some(bytes) = reply {
            let reply = Reply {
                bytes,
                is_close: reply_is_close,
            };
            stage_reply(outbox, reply);
            try_flush(&shared.tx, outbox);
        }

        let Some(event) = event else {
            continue;
        };
        let result = match event {
            Event::Text(text) => handler.on_text(handle, text).await,
            Event::Binary(data) => handler.on_binary(handle, data).await,
            Event::TextFragment { text, last } => {
                handler.on_text_fragment(handle, text, last).await
            }
            Event::BinaryFragment { data, last } => {
                handler.on_binary_fragment(handle, data, last).await
            }
            Event::Ping(data) => handler.on_ping(handle, data).await,
            Event::Pong(data) => handler.on_pong(handle, data).await,
        };
        if let Err(err) = result {
            handler.on_error(handle, &Error::Handler(err)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{self, DecodeLimits, Frame};
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadBuf};

    /// Records callbacks; echoes text when `echo` is set
    #[derive(Default)]
    struct Recorder {
        echo: bool,
        texts: Mutex<Vec<String>>,
        fragments: Mutex<Vec<(String, bool)>>,
        pings: Mutex<Vec<Bytes>>,
        errors: Mutex<Vec<String>>,
        closes: Mutex<Vec<CloseReason>>,
    }

    impl Handler for Arc<Recorder> {
        async fn on_text(&self, conn: &ConnectionHandle, text: String) -> anyhow::Result<()> {
            self.texts.lock().push(text.clone());
            if self.echo {
                let _ = conn.send_text(text).await?;
            }
            Ok(())
        }

        async fn on_text_fragment(
            &self,
            _conn: &ConnectionHandle,
            text: String,
            last: bool,
        ) -> anyhow::Result<()> {
            self.fragments.lock().push((text, last));
            Ok(())
        }

        async fn on_ping(&self, _conn: &ConnectionHandle, data: Bytes) -> anyhow::Result<()> {
            self.pings.lock().push(data);
            Ok(())
        }

        async fn on_error(&self, _conn: &ConnectionHandle, error: &Error) {
            self.errors.lock().push(error.to_string());
        }

        async fn on_close(
            &self,
            _conn: &ConnectionHandle,
            reason: CloseReason,
        ) -> anyhow::Result<()> {
            self.closes.lock().push(reason);
            Ok(())
        }
    }

    fn spawn_server(io: DuplexStream, config: Config) -> (Arc<Recorder>, ConnectionHandle, Task) {
        let recorder = Arc::new(Recorder::default());
        let connection = Connection::from_raw(io, Role::Server, config, recorder.clone());
        let handle = connection.handle();
        (recorder, handle, tokio::spawn(connection.run()))
    }

    type Task = tokio::task::JoinHandle<CloseReason>;

    fn quick_config() -> Config {
        Config::builder()
            .idle_timeout(None)
            .close_timeout(Duration::from_millis(200))
            .build()
    }

    /// Read frames sent by a server connection
    async fn read_frame(peer: &mut DuplexStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some((frame, used)) = frame::decode(buf, &DecodeLimits::default()).unwrap() {
                buf.advance(used);
                return frame;
            }
            let n = peer.read_buf(buf).await.unwrap();
            assert!(n > 0, "peer closed before a frame arrived");
        }
    }

    async fn send_frame(peer: &mut DuplexStream, frame: Frame) {
        let bytes = frame::encode(&frame.with_mask([7, 7, 7, 7]));
        peer.write_all(&bytes).await.unwrap();
    }

    /// Reads from a duplex, fails every write
    struct BrokenWrites(DuplexStream);

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Floods its peer with binary messages from `on_open`, counts what arrives
    struct Flood {
        messages: usize,
        size: usize,
        received: AtomicUsize,
    }

    impl Handler for Arc<Flood> {
        async fn on_open(&self, conn: &ConnectionHandle) -> anyhow::Result<()> {
            let conn = conn.clone();
            let payload = Bytes::from(vec![0xA5; self.size]);
            let messages = self.messages;
            tokio::spawn(async move {
                for _ in 0..messages {
                    if conn.send_binary(payload.clone()).await.is_err() {
                        break;
                    }
                }
            });
            Ok(())
        }

        async fn on_binary(&self, _conn: &ConnectionHandle, data: Bytes) -> anyhow::Result<()> {
            assert_eq!(data.len(), self.size);
            self.received.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_mutual_flood_with_small_queues() {
        let (a_io, b_io) = tokio::io::duplex(8 * 1024);
        let config = Config::builder()
            .idle_timeout(None)
            .write_queue_capacity(8)
            .build();
        let flood = || {
            Arc::new(Flood {
                messages: 300,
                size: 16 * 1024,
                received: AtomicUsize::new(0),
            })
        };
        let (a, b) = (flood(), flood());
        let server = Connection::from_raw(a_io, Role::Server, config.clone(), a.clone());
        let client = Connection::from_raw(b_io, Role::Client, config, b.clone());
        let (server_handle, client_handle) = (server.handle(), client.handle());
        let server_task = tokio::spawn(server.run());
        let client_task = tokio::spawn(client.run());

        let drained = tokio::time::timeout(Duration::from_secs(20), async {
            while a.received.load(Ordering::Acquire) < 300
                || b.received.load(Ordering::Acquire) < 300
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "both sides must receive every message");

        // Pings still get answered once the floods are through
        let _ = client_handle.ping("after").await.unwrap();
        let written = client_handle.close(CloseReason::normal()).await.unwrap();
        assert!(written.await.is_completed());
        assert_eq!(client_task.await.unwrap().code, CloseCode::Normal);
        assert_eq!(server_task.await.unwrap().code, CloseCode::Normal);
        assert!(!server_handle.is_open());
    }

    #[tokio::test]
    async fn test_failed_write_fails_completion_and_closes_abnormally() {
        let (server_io, _peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let io = BrokenWrites(server_io);
        let connection = Connection::from_raw(io, Role::Server, quick_config(), recorder.clone());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run());

        tokio::task::yield_now().await;
        let outcome = handle.send_text("lost").await.unwrap().await;
        assert!(matches!(outcome, WriteOutcome::Failed(Error::Shared(_))));
        assert_eq!(outcome.into_result().unwrap_err().close_code(), CloseCode::Abnormal);

        let reason = task.await.unwrap();
        assert_eq!(reason.code, CloseCode::Abnormal);
        assert_eq!(recorder.closes.lock().as_slice(), &[reason]);
    }

    #[tokio::test]
    async fn test_streamed_text_fragments_reach_handler() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let config = Config::builder()
            .idle_timeout(None)
            .stream_fragments(true)
            .build();
        let (recorder, _handle, task) = spawn_server(server_io, config);

        let euro = "€".as_bytes();
        send_frame(&mut peer, Frame::new(OpCode::Text, vec![b'x', euro[0]], false)).await;
        send_frame(&mut peer, Frame::continuation(euro[1..].to_vec(), true)).await;
        send_frame(&mut peer, Frame::text("whole")).await;
        send_frame(&mut peer, Frame::close(CloseCode::Normal, "")).await;

        assert_eq!(task.await.unwrap().code, CloseCode::Normal);
        let fragments = recorder.fragments.lock().clone();
        assert_eq!(fragments, vec![("x".to_string(), false), ("€".to_string(), true)]);
        assert_eq!(recorder.texts.lock().as_slice(), &["whole".to_string()]);
    }

    #[tokio::test]
    async fn test_rsv_on_control_frame_fails_with_1002() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let (recorder, _handle, task) = spawn_server(server_io, quick_config());
        let mut buf = BytesMut::new();

        let mut ping = Frame::ping("x");
        ping.rsv1 = true;
        send_frame(&mut peer, ping).await;

        let close = read_frame(&mut peer, &mut buf).await;
        let code = close.parse_close().unwrap().map(|r| r.code);
        assert_eq!(code, Some(CloseCode::ProtocolError));
        assert_eq!(task.await.unwrap().code, CloseCode::ProtocolError);
        assert!(recorder.pings.lock().is_empty());
    }

    #[tokio::test]
    async fn test_echo_and_close_from_peer() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder {
            echo: true,
            ..Recorder::default()
        });
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let task = tokio::spawn(connection.run());
        let mut buf = BytesMut::new();

        send_frame(&mut peer, Frame::text("hello")).await;
        let echoed = read_frame(&mut peer, &mut buf).await;
        assert_eq!(echoed.payload.as_ref(), b"hello");
        assert!(echoed.mask.is_none());

        send_frame(&mut peer, Frame::ping("hb")).await;
        let pong = read_frame(&mut peer, &mut buf).await;
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload.as_ref(), b"hb");

        send_frame(&mut peer, Frame::close(CloseCode::Other(4001), "done")).await;
        let echo = read_frame(&mut peer, &mut buf).await;
        assert_eq!(echo.parse_close().unwrap().map(|r| r.code), Some(CloseCode::Other(4001)));

        let reason = task.await.unwrap();
        assert_eq!(reason.code, CloseCode::Other(4001));
        assert_eq!(recorder.closes.lock().len(), 1);
        assert_eq!(recorder.pings.lock().as_slice(), &[Bytes::from_static(b"hb")]);
    }

    #[tokio::test]
    async fn test_local_close_waits_for_peer() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run());
        let mut buf = BytesMut::new();

        tokio::task::yield_now().await;
        let written = handle.close(CloseReason::new(CloseCode::GoingAway, "bye")).await.unwrap();
        assert!(written.await.is_completed());
        assert_eq!(handle.state(), ConnectionState::Closing);
        assert!(matches!(handle.send_text("late").await, Err(Error::ConnectionClosed)));

        let close = read_frame(&mut peer, &mut buf).await;
        assert_eq!(close.parse_close().unwrap().map(|r| r.code), Some(CloseCode::GoingAway));
        send_frame(&mut peer, Frame::close(CloseCode::Normal, "")).await;

        let reason = task.await.unwrap();
        assert_eq!(reason.code, CloseCode::GoingAway);
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert_eq!(recorder.closes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_closes_with_1002() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let task = tokio::spawn(connection.run());
        let mut buf = BytesMut::new();

        // RSV1 with no extension negotiated
        let mut frame = Frame::text("x");
        frame.rsv1 = true;
        send_frame(&mut peer, frame).await;

        let close = read_frame(&mut peer, &mut buf).await;
        assert_eq!(close.parse_close().unwrap().map(|r| r.code), Some(CloseCode::ProtocolError));
        let reason = task.await.unwrap();
        assert_eq!(reason.code, CloseCode::ProtocolError);
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(recorder.texts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_ping_rejected_before_payload() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let task = tokio::spawn(connection.run());
        let mut buf = BytesMut::new();

        // Header only: masked ping announcing 126 bytes
        peer.write_all(&[0x89, 0x80 | 126, 0x00, 126]).await.unwrap();
        let close = read_frame(&mut peer, &mut buf).await;
        assert_eq!(close.parse_close().unwrap().map(|r| r.code), Some(CloseCode::ProtocolError));
        assert_eq!(task.await.unwrap().code, CloseCode::ProtocolError);
        assert!(recorder.pings.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_reports_abnormal() {
        let (server_io, peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let task = tokio::spawn(connection.run());
        drop(peer);

        assert_eq!(task.await.unwrap().code, CloseCode::Abnormal);
        assert_eq!(recorder.closes.lock()[0].code, CloseCode::Abnormal);
    }

    #[tokio::test]
    async fn test_abort_cancels_and_reports_abnormal() {
        let (server_io, _peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run());

        tokio::task::yield_now().await;
        handle.abort();
        assert!(!handle.is_open());
        assert_eq!(task.await.unwrap().code, CloseCode::Abnormal);
        assert!(matches!(handle.send_binary(vec![1u8]).await, Err(Error::ConnectionClosed)));
        assert_eq!(recorder.closes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_timeout_without_reply() {
        let (server_io, _peer) = tokio::io::duplex(4096);
        let recorder = Arc::new(Recorder::default());
        let connection =
            Connection::from_raw(server_io, Role::Server, quick_config(), recorder.clone());
        let handle = connection.handle();
        let task = tokio::spawn(connection.run());

        tokio::task::yield_now().await;
        let _ = handle.close(CloseReason::normal()).await.unwrap();
        let reason = task.await.unwrap();
        assert_eq!(reason.code, CloseCode::Abnormal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_sends_going_away() {
        let (server_io, mut peer) = tokio::io::duplex(4096);
        let config = Config::builder()
            .idle_timeout(Some(Duration::from_secs(5)))
            .close_timeout(Duration::from_secs(1))
            .build();
        let recorder = Arc::new(Recorder::default());
        let connection = Connection::from_raw(server_io, Role::Server, config, recorder.clone());
        let task = tokio::spawn(connection.run());
        let mut buf = BytesMut::new();

        let close = read_frame(&mut peer, &mut buf).await;
        assert_eq!(close.parse_close().unwrap().map(|r| r.code), Some(CloseCode::GoingAway));
        send_frame(&mut peer, Frame::close(CloseCode::GoingAway, "")).await;
        assert_eq!(task.await.unwrap().code, CloseCode::GoingAway);
    }
}
