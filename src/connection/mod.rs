//! Connection state machine and driver
//!
//! A [`Connection`] owns an upgraded transport. [`Connection::run`] reads
//! frames, reassembles messages, answers pings and close frames, and calls the
//! [`Handler`]. Outbound frames go through a single writer task, so every
//! [`ConnectionHandle`] send resolves one [`WriteOutcome`] in submission order.
//!
//! ```text
//! Connecting ──► Open ──► Closing ──► Closed
//!      │           │                    ▲
//!      └───────────┴────────────────────┘  (handshake failure / disconnect)
//! ```

mod protocol;
mod session;
mod state;
mod writer;

use std::future::Future;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

pub use session::{Connection, ConnectionHandle};
pub use state::{ConnectionState, wire_close_code};
pub use writer::{WriteFuture, WriteOutcome};

use crate::error::{CloseReason, Error, Result};
use crate::handshake::{ClientOptions, ServerPolicy, client_handshake, server_handshake};
use crate::{Config, Role};

/// Application callbacks for one connection
///
/// Every method has a default that ignores the event. Returning `Err` from a
/// message callback is reported through [`Handler::on_error`] and leaves the
/// connection open; an `Err` from [`Handler::on_open`] closes it with 1011.
///
/// Methods may be written as `async fn` in implementations.
pub trait Handler: Send + Sync + 'static {
    /// The connection is open
    fn on_open(&self, _conn: &ConnectionHandle) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// A complete text message arrived
    fn on_text(
        &self,
        _conn: &ConnectionHandle,
        _text: String,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// A complete binary message arrived
    fn on_binary(
        &self,
        _conn: &ConnectionHandle,
        _data: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// One fragment of a text message, with [`Config::stream_fragments`] set
    ///
    /// `text` ends on a code point boundary; bytes of a split code point are
    /// delivered with the next fragment.
    fn on_text_fragment(
        &self,
        _conn: &ConnectionHandle,
        _text: String,
        _last: bool,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// One fragment of a binary message, with [`Config::stream_fragments`] set
    fn on_binary_fragment(
        &self,
        _conn: &ConnectionHandle,
        _data: Bytes,
        _last: bool,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// A ping arrived; the pong was already queued
    fn on_ping(
        &self,
        _conn: &ConnectionHandle,
        _data: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// A pong arrived
    fn on_pong(
        &self,
        _conn: &ConnectionHandle,
        _data: Bytes,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// The connection closed; called exactly once
    fn on_close(
        &self,
        _conn: &ConnectionHandle,
        _reason: CloseReason,
    ) -> impl Future<Output = anyhow::Result<()>> + Send {
        async { Ok(()) }
    }

    /// A protocol, transport or callback error occurred
    fn on_error(&self, conn: &ConnectionHandle, error: &Error) -> impl Future<Output = ()> + Send {
        tracing::debug!(id = %conn.id(), error = %error, "connection error");
        async {}
    }
}

/// Run the server handshake on `stream` and wrap it in a [`Connection`]
///
/// On failure the error response was already written and no connection exists.
pub async fn accept<S, H>(
    mut stream: S,
    policy: &ServerPolicy,
    config: Config,
    handler: H,
) -> Result<Connection<S, H>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let upgraded = server_handshake(&mut stream, policy).await?;
    Ok(Connection::new(stream, Role::Server, upgraded, config, handler))
}

/// Run the client handshake for `uri` on `stream` and wrap it in a [`Connection`]
pub async fn connect<S, H>(
    mut stream: S,
    uri: &str,
    options: &ClientOptions,
    config: Config,
    handler: H,
) -> Result<Connection<S, H>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let upgraded = client_handshake(&mut stream, uri, options).await?;
    Ok(Connection::new(stream, Role::Client, upgraded, config, handler))
}
