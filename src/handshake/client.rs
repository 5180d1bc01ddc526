//! Client side of the opening handshake

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::headers::{HandshakeRequest, HandshakeResponse, Headers, parse_response};
use super::key::SecurityKey;
use super::variant::HandshakeVariant;
use super::{
    CONNECTION, HOST, NegotiatedParams, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_KEY1, SEC_WEBSOCKET_KEY2, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE, Upgraded, hixie, read_message,
};
use crate::Config;
use crate::error::{HandshakeError, Result};
use crate::extension::{ExtensionOffer, ExtensionProvider, SharedProvider, configure_client};

/// What the client must see echoed back to trust the response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentKey {
    /// `Sec-WebSocket-Key` nonce, answered by `Sec-WebSocket-Accept`
    Nonce(SecurityKey),
    /// Expected hixie-76 challenge answer
    Challenge([u8; 16]),
}

/// What the client offered, needed to interpret the response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Offered {
    /// Requested subprotocols, in preference order
    pub subprotocols: Vec<String>,
    /// Offered extensions
    pub extensions: Vec<ExtensionOffer>,
    /// Variant the request was built for
    pub variant: HandshakeVariant,
}

/// A built upgrade request and the state needed to validate its response
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    /// Request to send
    pub request: HandshakeRequest,
    /// Key material to check the response against
    pub key: SentKey,
    /// Offer the response is validated against
    pub offered: Offered,
}

/// Build an RFC 6455 upgrade request for `target_uri`
pub fn build_client_request(
    target_uri: &str,
    subprotocols: &[String],
    extensions: &[ExtensionOffer],
) -> std::result::Result<ClientHandshake, HandshakeError> {
    build_request(
        target_uri,
        Offered {
            subprotocols: subprotocols.to_vec(),
            extensions: extensions.to_vec(),
            variant: HandshakeVariant::Rfc6455,
        },
        None,
        &Headers::new(),
    )
}

/// Split a `ws://` / `wss://` URI into the `Host` value and request target
fn parse_target(target_uri: &str) -> std::result::Result<(String, String), HandshakeError> {
    let invalid = || HandshakeError::InvalidUri(target_uri.to_string());
    let uri: http::Uri = target_uri.parse().map_err(|_| invalid())?;

    match uri.scheme_str() {
        Some(scheme)
            if scheme.eq_ignore_ascii_case("ws") || scheme.eq_ignore_ascii_case("wss") => {}
        _ => return Err(invalid()),
    }
    let host = uri.host().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let host = match uri.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty() && *pq != "?")
        .unwrap_or("/");
    let target = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{target}")
    };

    Ok((host, target))
}

fn build_request(
    target_uri: &str,
    mut offered: Offered,
    origin: Option<&str>,
    extra: &Headers,
) -> std::result::Result<ClientHandshake, HandshakeError> {
    let (host, target) = parse_target(target_uri)?;
    let mut request = HandshakeRequest::get(target);
    let headers = &mut request.headers;
    headers.append(HOST, host.as_str());

    let key = match offered.variant {
        HandshakeVariant::Rfc6455 | HandshakeVariant::Hybi { .. } => {
            let nonce = SecurityKey::generate();
            headers.append(UPGRADE, "websocket");
            headers.append(CONNECTION, "Upgrade");
            headers.append(SEC_WEBSOCKET_KEY, nonce.as_str());
            if let Some(version) = offered.variant.version() {
                headers.append(SEC_WEBSOCKET_VERSION, version.to_string());
            }
            if let Some(origin) = origin {
                headers.append(offered.variant.origin_header(), origin);
            }
            if !offered.extensions.is_empty() {
                headers.append(
                    SEC_WEBSOCKET_EXTENSIONS,
                    ExtensionOffer::format_header(&offered.extensions),
                );
            }
            SentKey::Nonce(nonce)
        }
        HandshakeVariant::Hixie76 => {
            let (key1, n1) = hixie::generate_key();
            let (key2, n2) = hixie::generate_key();
            let key3 = hixie::generate_key3();
            headers.append(CONNECTION, "Upgrade");
            headers.append(UPGRADE, "WebSocket");
            headers.append(SEC_WEBSOCKET_KEY1, key1);
            headers.append(SEC_WEBSOCKET_KEY2, key2);
            let origin = origin.map_or_else(|| format!("http://{host}"), str::to_string);
            headers.append(ORIGIN, origin);
            request.body = Bytes::copy_from_slice(&key3);
            offered.extensions.clear();
            SentKey::Challenge(hixie::challenge_response(n1, n2, &key3))
        }
    };

    if !offered.subprotocols.is_empty() {
        request
            .headers
            .append(SEC_WEBSOCKET_PROTOCOL, offered.subprotocols.join(", "));
    }
    for (name, value) in extra.iter() {
        request.headers.append(name, value);
    }

    Ok(ClientHandshake {
        request,
        key,
        offered,
    })
}

/// Validate the server's response against what was sent
///
/// The subprotocol is the first value of the response that the client asked
/// for. Extensions keep the server's order; entries the client never offered
/// are dropped.
pub fn validate_server_response(
    response: &HandshakeResponse,
    sent_key: &SentKey,
    offered: &Offered,
) -> std::result::Result<NegotiatedParams, HandshakeError> {
    if response.status != 101 {
        return Err(HandshakeError::StatusError(response.status));
    }
    let headers = &response.headers;

    match sent_key {
        SentKey::Nonce(key) => {
            if !headers.has_token(UPGRADE, "websocket") {
                return Err(HandshakeError::InvalidHeader(UPGRADE));
            }
            if !headers.has_token(CONNECTION, "upgrade") {
                return Err(HandshakeError::InvalidHeader(CONNECTION));
            }
            let accept = headers
                .get(SEC_WEBSOCKET_ACCEPT)
                .ok_or(HandshakeError::AcceptMismatch)?;
            if !key.verify_accept(accept) {
                return Err(HandshakeError::AcceptMismatch);
            }
        }
        SentKey::Challenge(expected) => {
            if response.body.as_ref() != expected.as_slice() {
                return Err(HandshakeError::AcceptMismatch);
            }
        }
    }

    let subprotocol = headers
        .tokens(SEC_WEBSOCKET_PROTOCOL)
        .find(|p| offered.subprotocols.iter().any(|o| o == p))
        .map(str::to_string);

    let mut extensions: Vec<ExtensionOffer> = Vec::new();
    if let Some(value) = headers.get_joined(SEC_WEBSOCKET_EXTENSIONS) {
        for ext in ExtensionOffer::parse_header(&value) {
            let was_offered = offered
                .extensions
                .iter()
                .any(|o| o.name.eq_ignore_ascii_case(&ext.name));
            let duplicate = extensions
                .iter()
                .any(|e| e.name.eq_ignore_ascii_case(&ext.name));
            if was_offered && !duplicate {
                extensions.push(ext);
            } else {
                tracing::warn!(extension = %ext, "dropping extension the client did not offer");
            }
        }
    }

    Ok(NegotiatedParams {
        subprotocol,
        extensions,
        variant: offered.variant,
    })
}

// ============================================================================
// Options and async driver
// ============================================================================

/// Client-side handshake options
#[derive(Clone, Default)]
pub struct ClientOptions {
    subprotocols: Vec<String>,
    extensions: Vec<SharedProvider>,
    origin: Option<String>,
    variant: HandshakeVariant,
    headers: Headers,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("subprotocols", &self.subprotocols)
            .field(
                "extensions",
                &self.extensions.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("origin", &self.origin)
            .field("variant", &self.variant)
            .finish()
    }
}

impl ClientOptions {
    /// RFC 6455 request without subprotocols or extensions
    pub fn new() -> Self {
        Self::default()
    }

    /// Options derived from connection configuration
    ///
    /// Offers permessage-deflate when `config.compression` is set.
    pub fn from_config(config: &Config) -> Self {
        let options = Self::new();
        #[cfg(feature = "permessage-deflate")]
        {
            if let Some(deflate) = &config.compression {
                return options.extension(
                    crate::extension::deflate::DeflateProvider::new(deflate.clone())
                        .with_max_message_size(config.max_message_size),
                );
            }
        }
        #[cfg(not(feature = "permessage-deflate"))]
        let _ = config;
        options
    }

    /// Request a subprotocol (in preference order)
    pub fn subprotocol(mut self, name: impl Into<String>) -> Self {
        self.subprotocols.push(name.into());
        self
    }

    /// Offer an extension
    pub fn extension(mut self, provider: impl ExtensionProvider + 'static) -> Self {
        self.extensions.push(Arc::new(provider));
        self
    }

    /// Offer an already shared extension provider
    pub fn shared_extension(mut self, provider: SharedProvider) -> Self {
        self.extensions.push(provider);
        self
    }

    /// Send an origin
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Speak a legacy draft instead of RFC 6455
    pub fn variant(mut self, variant: HandshakeVariant) -> Self {
        self.variant = variant;
        self
    }

    /// Add an extra request header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Build the upgrade request these options describe
    pub fn build_request(
        &self,
        target_uri: &str,
    ) -> std::result::Result<ClientHandshake, HandshakeError> {
        let offered = Offered {
            subprotocols: self.subprotocols.clone(),
            extensions: self.extensions.iter().map(|p| p.offer()).collect(),
            variant: self.variant,
        };
        build_request(target_uri, offered, self.origin.as_deref(), &self.headers)
    }
}

/// Run the client side of the handshake over `stream`
pub async fn client_handshake<S>(
    stream: &mut S,
    target_uri: &str,
    options: &ClientOptions,
) -> Result<Upgraded>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let handshake = options.build_request(target_uri)?;
    stream.write_all(&handshake.request.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = BytesMut::with_capacity(4096);
    let (response, consumed) = read_message(stream, &mut buf, parse_response).await?;
    let params = validate_server_response(&response, &handshake.key, &handshake.offered)?;
    let extensions = configure_client(&params.extensions, &options.extensions)?;

    tracing::debug!(
        uri = target_uri,
        variant = ?params.variant,
        subprotocol = params.subprotocol.as_deref().unwrap_or(""),
        extensions = ?extensions.names(),
        "upgrade complete"
    );

    Ok(Upgraded {
        params,
        extensions,
        target: handshake.request.target,
        leftover: buf.split_off(consumed).freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::server::{ServerPolicy, build_server_response};

    fn accept_for(handshake: &ClientHandshake) -> HandshakeResponse {
        build_server_response(&handshake.request, &ServerPolicy::default())
            .unwrap()
            .response
    }

    #[test]
    fn test_request_headers() {
        let handshake = build_client_request(
            "ws://example.com:9000/chat?x=1",
            &["chat".to_string(), "superchat".to_string()],
            &[ExtensionOffer::new("permessage-deflate")],
        )
        .unwrap();
        let req = &handshake.request;
        assert_eq!(req.target, "/chat?x=1");
        assert_eq!(req.headers.get(HOST), Some("example.com:9000"));
        assert_eq!(req.headers.get(SEC_WEBSOCKET_VERSION), Some("13"));
        assert_eq!(req.headers.get(SEC_WEBSOCKET_PROTOCOL), Some("chat, superchat"));
        assert_eq!(req.headers.get(SEC_WEBSOCKET_EXTENSIONS), Some("permessage-deflate"));
        let SentKey::Nonce(key) = &handshake.key else {
            panic!("expected a nonce");
        };
        assert_eq!(req.headers.get(SEC_WEBSOCKET_KEY), Some(key.as_str()));
    }

    #[test]
    fn test_empty_path_becomes_root() {
        let handshake = build_client_request("wss://example.com", &[], &[]).unwrap();
        assert_eq!(handshake.request.target, "/");
        assert_eq!(handshake.request.headers.get(HOST), Some("example.com"));
    }

    #[test]
    fn test_invalid_uris() {
        for uri in ["http://example.com/", "example.com/chat", "ws:///nohost", "not a uri"] {
            assert!(
                matches!(build_client_request(uri, &[], &[]), Err(HandshakeError::InvalidUri(_))),
                "{uri}"
            );
        }
    }

    #[test]
    fn test_validate_against_server() {
        let handshake = build_client_request("ws://localhost/", &[], &[]).unwrap();
        let response = accept_for(&handshake);
        let params =
            validate_server_response(&response, &handshake.key, &handshake.offered).unwrap();
        assert_eq!(params.variant, HandshakeVariant::Rfc6455);
        assert!(params.subprotocol.is_none());
    }

    #[test]
    fn test_status_error() {
        let handshake = build_client_request("ws://localhost/", &[], &[]).unwrap();
        let response = HandshakeResponse::new(403);
        assert_eq!(
            validate_server_response(&response, &handshake.key, &handshake.offered),
            Err(HandshakeError::StatusError(403))
        );
    }

    #[test]
    fn test_accept_mismatch() {
        let handshake = build_client_request("ws://localhost/", &[], &[]).unwrap();
        let mut response = accept_for(&handshake);
        response
            .headers
            .insert(SEC_WEBSOCKET_ACCEPT, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(
            validate_server_response(&response, &handshake.key, &handshake.offered),
            Err(HandshakeError::AcceptMismatch)
        );

        let mut missing = accept_for(&handshake);
        missing.headers.insert(SEC_WEBSOCKET_ACCEPT, "");
        assert_eq!(
            validate_server_response(&missing, &handshake.key, &handshake.offered),
            Err(HandshakeError::AcceptMismatch)
        );
    }

    #[test]
    fn test_server_subprotocol_and_unknown_extensions() {
        let handshake = build_client_request(
            "ws://localhost/",
            &["a".to_string(), "b".to_string()],
            &[ExtensionOffer::new("permessage-deflate")],
        )
        .unwrap();
        let mut response = accept_for(&handshake);
        response.headers.append(SEC_WEBSOCKET_PROTOCOL, "b");
        response
            .headers
            .append(SEC_WEBSOCKET_EXTENSIONS, "x-surprise, permessage-deflate");

        let params =
            validate_server_response(&response, &handshake.key, &handshake.offered).unwrap();
        assert_eq!(params.subprotocol.as_deref(), Some("b"));
        assert_eq!(params.extensions, vec![ExtensionOffer::new("permessage-deflate")]);
    }

    #[test]
    fn test_hixie_client_round_trip() {
        let options = ClientOptions::new().variant(HandshakeVariant::Hixie76);
        let handshake = options.build_request("ws://example.com/demo").unwrap();
        assert_eq!(handshake.request.body.len(), 8);

        let response = accept_for(&handshake);
        assert_eq!(response.body.len(), 16);
        let params =
            validate_server_response(&response, &handshake.key, &handshake.offered).unwrap();
        assert_eq!(params.variant, HandshakeVariant::Hixie76);

        let mut tampered = response.clone();
        tampered.body = Bytes::from_static(b"0123456789abcdef");
        assert_eq!(
            validate_server_response(&tampered, &handshake.key, &handshake.offered),
            Err(HandshakeError::AcceptMismatch)
        );
    }

    #[test]
    fn test_hybi_client_uses_sec_origin() {
        let options = ClientOptions::new()
            .variant(HandshakeVariant::Hybi { version: 8 })
            .origin("http://example.com");
        let handshake = options.build_request("ws://example.com/").unwrap();
        let headers = &handshake.request.headers;
        assert_eq!(headers.get(SEC_WEBSOCKET_VERSION), Some("8"));
        assert_eq!(headers.get("Sec-WebSocket-Origin"), Some("http://example.com"));
        assert!(!headers.contains(ORIGIN));
    }
}
