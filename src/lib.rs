//! # ws-engine: WebSocket protocol engine
//!
//! Turns an upgraded byte stream into a message channel and back:
//!
//! - **Handshake**: RFC 6455 upgrade for clients and servers, plus the
//!   hybi-07/08 and hixie-76 drafts, subprotocol and extension negotiation
//! - **Frame codec**: pure encode/decode of RFC 6455 frames (and the hixie-76
//!   sentinel format), masking, minimal-length enforcement
//! - **Extensions**: an ordered pipeline of frame transforms, with
//!   permessage-deflate (RFC 7692) built in
//! - **Connection**: the open / closing / closed state machine, fragment
//!   reassembly, automatic pong and close replies, and a single writer task
//!   that reports one completion per write
//!
//! ## Example
//!
//! ```ignore
//! use ws_engine::prelude::*;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     async fn on_text(&self, conn: &ConnectionHandle, text: String) -> anyhow::Result<()> {
//!         conn.send_text(text).await?.await.into_result()?;
//!         Ok(())
//!     }
//! }
//!
//! let policy = ServerPolicy::default();
//! let connection = ws_engine::accept(tcp, &policy, Config::default(), Echo).await?;
//! let reason = connection.run().await;
//! ```

pub mod connection;
pub mod error;
pub mod extension;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod utf8;

pub use connection::{
    Connection, ConnectionHandle, ConnectionState, Handler, WriteFuture, WriteOutcome, accept,
    connect,
};
pub use error::{CloseCode, CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use handshake::{ClientOptions, HandshakeVariant, NegotiatedParams, ServerPolicy};

#[cfg(feature = "permessage-deflate")]
pub use extension::deflate::{DeflateConfig, DeflateProvider};

use std::time::Duration;

/// Default receive buffer size
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Maximum frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload that fits the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload that fits the 16-bit extended length
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default cap on a reassembled message (64MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default cap on a single frame (16MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

// ============================================================================
// Configuration
// ============================================================================

/// Per-connection limits and timers
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ws_engine::Config;
///
/// let config = Config::builder()
///     .max_message_size(1024 * 1024)
///     .idle_timeout(Some(Duration::from_secs(30)))
///     .close_timeout(Duration::from_secs(2))
///     .build();
/// assert_eq!(config.max_message_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum payload of a single frame (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Close with 1001 when nothing is received for this long (default: 120s)
    pub idle_timeout: Option<Duration>,
    /// How long to wait for the peer's close frame (default: 5s)
    pub close_timeout: Duration,
    /// Writes queued ahead of the writer task before senders wait (default: 64)
    pub write_queue_capacity: usize,
    /// Deliver fragmented messages piece by piece instead of reassembling
    /// them (default: off)
    ///
    /// Fragments go to [`Handler::on_text_fragment`] and
    /// [`Handler::on_binary_fragment`]; `max_message_size` does not apply
    /// since nothing is buffered. Unfragmented messages still arrive whole.
    pub stream_fragments: bool,
    /// Offer / accept permessage-deflate with these parameters (default: off)
    #[cfg(feature = "permessage-deflate")]
    pub compression: Option<DeflateConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            idle_timeout: Some(Duration::from_secs(120)),
            close_timeout: Duration::from_secs(5),
            write_queue_capacity: 64,
            stream_fragments: false,
            #[cfg(feature = "permessage-deflate")]
            compression: None,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for [`Config`]
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum frame payload
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set both frame and message limits
    pub fn max_payload_length(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self.config.max_frame_size = size;
        self
    }

    /// Set the idle timeout, `None` disables it
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set the close handshake timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Set the write queue capacity (at least 1)
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.write_queue_capacity = capacity.max(1);
        self
    }

    /// Deliver fragmented messages as they arrive
    pub fn stream_fragments(mut self, enabled: bool) -> Self {
        self.config.stream_fragments = enabled;
        self
    }

    /// Enable permessage-deflate
    #[cfg(feature = "permessage-deflate")]
    pub fn compression(mut self, config: DeflateConfig) -> Self {
        self.config.compression = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionHandle, Handler, WriteOutcome};
    pub use crate::error::{CloseCode, CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::handshake::{ClientOptions, ServerPolicy};
    pub use crate::{Config, Role};
}
