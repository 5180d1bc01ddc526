//! WebSocket opening handshake
//!
//! The handshake is split into pure message builders/validators and thin async
//! drivers on top of them:
//! - [`build_client_request`] / [`validate_server_response`] for clients
//! - [`build_server_response`] for servers, driven by a [`ServerPolicy`]
//! - [`client_handshake`] / [`server_handshake`] run the exchange over any
//!   `AsyncRead + AsyncWrite` stream and hand back the bytes read past the
//!   HTTP message
//!
//! Protocol-version differences (RFC 6455, hybi-07/08, hixie-76) are captured by
//! [`HandshakeVariant`].

pub mod client;
pub mod headers;
pub mod hixie;
pub mod key;
pub mod server;
pub mod variant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

pub use client::{
    ClientHandshake, ClientOptions, Offered, SentKey, build_client_request, client_handshake,
    validate_server_response,
};
pub use headers::{HandshakeRequest, HandshakeResponse, Headers, parse_request, parse_response};
pub use key::{SecurityKey, generate_accept_key};
pub use server::{
    ServerHandshake, ServerPolicy, ServerPolicyBuilder, build_server_response, server_handshake,
};
pub use variant::HandshakeVariant;

use crate::error::{Error, HandshakeError, Result};
use crate::extension::{ExtensionOffer, ExtensionPipeline};

/// Maximum HTTP header block size
pub const MAX_HEADER_SIZE: usize = 8192;

/// Body length of a hixie-76 request (key3)
pub const HIXIE_REQUEST_BODY_LEN: usize = 8;
/// Body length of a hixie-76 response (challenge answer)
pub const HIXIE_RESPONSE_BODY_LEN: usize = 16;

/// Versions advertised in a 426 response, newest first
pub const SUPPORTED_VERSIONS: &str = "13, 8, 7";

pub const HOST: &str = "Host";
pub const UPGRADE: &str = "Upgrade";
pub const CONNECTION: &str = "Connection";
pub const ORIGIN: &str = "Origin";
pub const SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
pub const SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";
pub const SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
pub const SEC_WEBSOCKET_PROTOCOL: &str = "Sec-WebSocket-Protocol";
pub const SEC_WEBSOCKET_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
pub const SEC_WEBSOCKET_ORIGIN: &str = "Sec-WebSocket-Origin";
pub const SEC_WEBSOCKET_LOCATION: &str = "Sec-WebSocket-Location";
pub const SEC_WEBSOCKET_KEY1: &str = "Sec-WebSocket-Key1";
pub const SEC_WEBSOCKET_KEY2: &str = "Sec-WebSocket-Key2";

/// Outcome of negotiation, as seen by both peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedParams {
    /// Selected subprotocol
    pub subprotocol: Option<String>,
    /// Accepted extensions, in the server's order
    pub extensions: Vec<ExtensionOffer>,
    /// Protocol variant the handshake used
    pub variant: HandshakeVariant,
}

/// A completed handshake, ready to become a connection
#[derive(Debug)]
pub struct Upgraded {
    /// Negotiated parameters
    pub params: NegotiatedParams,
    /// Extension stages for the connection
    pub extensions: ExtensionPipeline,
    /// Request target of the upgrade
    pub target: String,
    /// Bytes received after the HTTP message (start of the frame stream)
    pub leftover: Bytes,
}

/// Read until `parse` yields a complete message
async fn read_message<S, T, F>(
    stream: &mut S,
    buf: &mut BytesMut,
    mut parse: F,
) -> Result<(T, usize)>
where
    S: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> std::result::Result<Option<(T, usize)>, HandshakeError>,
{
    loop {
        if let Some(parsed) = parse(buf)? {
            return Ok(parsed);
        }
        if buf.len() > MAX_HEADER_SIZE + HIXIE_RESPONSE_BODY_LEN {
            return Err(HandshakeError::InvalidHttp("header block too large").into());
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}
