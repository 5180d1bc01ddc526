//! Server side of the opening handshake

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::headers::{HandshakeRequest, HandshakeResponse, parse_request};
use super::variant::HandshakeVariant;
use super::{
    CONNECTION, HOST, NegotiatedParams, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, SUPPORTED_VERSIONS, UPGRADE, Upgraded, read_message,
};
use crate::Config;
use crate::error::{HandshakeError, Result};
use crate::extension::{
    ExtensionOffer, ExtensionPipeline, ExtensionProvider, SharedProvider, negotiate_server,
};

// ============================================================================
// Policy
// ============================================================================

/// Read-only negotiation policy shared by every connection of an endpoint
#[derive(Clone)]
pub struct ServerPolicy {
    subprotocols: Vec<String>,
    origins: Option<Vec<String>>,
    extensions: Vec<SharedProvider>,
    secure: bool,
    legacy_drafts: bool,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            origins: None,
            extensions: Vec::new(),
            secure: false,
            legacy_drafts: true,
        }
    }
}

impl fmt::Debug for ServerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerPolicy")
            .field("subprotocols", &self.subprotocols)
            .field("origins", &self.origins)
            .field(
                "extensions",
                &self.extensions.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("secure", &self.secure)
            .field("legacy_drafts", &self.legacy_drafts)
            .finish()
    }
}

impl ServerPolicy {
    /// Start building a policy
    pub fn builder() -> ServerPolicyBuilder {
        ServerPolicyBuilder::new()
    }

    /// Policy derived from connection configuration
    ///
    /// Registers permessage-deflate when `config.compression` is set.
    pub fn from_config(config: &Config) -> Self {
        ServerPolicyBuilder::from_config(config).build()
    }

    /// Supported subprotocols, in preference order
    pub fn subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// Extension providers, in preference order
    pub fn extensions(&self) -> &[SharedProvider] {
        &self.extensions
    }

    /// Check an origin against the allow-list
    ///
    /// No list allows everything; with a list, a missing origin is rejected.
    pub fn check_origin(&self, origin: Option<&str>) -> std::result::Result<(), HandshakeError> {
        let Some(allowed) = &self.origins else {
            return Ok(());
        };
        match origin {
            Some(origin) if allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) => Ok(()),
            Some(origin) => Err(HandshakeError::OriginRejected(origin.to_string())),
            None => Err(HandshakeError::OriginRejected(String::new())),
        }
    }

    /// Pick the first supported subprotocol the client asked for
    pub fn select_subprotocol<'a>(
        &self,
        requested: impl IntoIterator<Item = &'a str>,
    ) -> Option<String> {
        let requested: Vec<&str> = requested.into_iter().collect();
        self.subprotocols
            .iter()
            .find(|p| requested.contains(&p.as_str()))
            .cloned()
    }
}

/// Builder for [`ServerPolicy`]
#[derive(Default)]
pub struct ServerPolicyBuilder {
    policy: ServerPolicy,
}

impl ServerPolicyBuilder {
    /// Create a builder with the default policy: no subprotocols, any origin,
    /// no extensions, legacy drafts accepted
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded from connection configuration
    pub fn from_config(config: &Config) -> Self {
        let builder = Self::new();
        #[cfg(feature = "permessage-deflate")]
        {
            if let Some(deflate) = &config.compression {
                return builder.extension(
                    crate::extension::deflate::DeflateProvider::new(deflate.clone())
                        .with_max_message_size(config.max_message_size),
                );
            }
        }
        #[cfg(not(feature = "permessage-deflate"))]
        let _ = config;
        builder
    }

    /// Add a supported subprotocol
    pub fn subprotocol(mut self, name: impl Into<String>) -> Self {
        self.policy.subprotocols.push(name.into());
        self
    }

    /// Allow an origin; once any origin is added only listed ones are accepted
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.policy
            .origins
            .get_or_insert_with(Vec::new)
            .push(origin.into());
        self
    }

    /// Register an extension provider
    pub fn extension(mut self, provider: impl ExtensionProvider + 'static) -> Self {
        self.policy.extensions.push(Arc::new(provider));
        self
    }

    /// Register an already shared extension provider
    pub fn shared_extension(mut self, provider: SharedProvider) -> Self {
        self.policy.extensions.push(provider);
        self
    }

    /// Whether the endpoint is served over TLS (affects hixie-76 locations)
    pub fn secure(mut self, secure: bool) -> Self {
        self.policy.secure = secure;
        self
    }

    /// Accept hybi-07/08 and hixie-76 clients
    pub fn legacy_drafts(mut self, enabled: bool) -> Self {
        self.policy.legacy_drafts = enabled;
        self
    }

    /// Build the policy
    pub fn build(self) -> ServerPolicy {
        self.policy
    }
}

// ============================================================================
// Response building
// ============================================================================

/// Accepted upgrade: the response to send and the negotiated state
pub struct ServerHandshake {
    /// `101` response
    pub response: HandshakeResponse,
    /// Negotiated parameters
    pub params: NegotiatedParams,
    /// Extension stages for the connection
    pub extensions: ExtensionPipeline,
}

impl fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("response", &self.response)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Validate an upgrade request and build the `101` response
pub fn build_server_response(
    request: &HandshakeRequest,
    policy: &ServerPolicy,
) -> std::result::Result<ServerHandshake, HandshakeError> {
    let headers = &request.headers;

    if request.method != "GET" {
        return Err(HandshakeError::MethodNotAllowed);
    }
    if !headers.contains(UPGRADE) {
        return Err(HandshakeError::MissingHeader(UPGRADE));
    }
    if !headers.has_token(UPGRADE, "websocket") {
        return Err(HandshakeError::InvalidHeader(UPGRADE));
    }
    if !headers.contains(CONNECTION) {
        return Err(HandshakeError::MissingHeader(CONNECTION));
    }
    if !headers.has_token(CONNECTION, "upgrade") {
        return Err(HandshakeError::InvalidHeader(CONNECTION));
    }
    if !headers.contains(HOST) {
        return Err(HandshakeError::MissingHeader(HOST));
    }

    let variant = HandshakeVariant::from_request(request)?;
    if variant != HandshakeVariant::Rfc6455 && !policy.legacy_drafts {
        let version = headers.get(SEC_WEBSOCKET_VERSION).unwrap_or("0");
        return Err(HandshakeError::UnsupportedVersion(version.to_string()));
    }
    let key = variant.request_key(request)?;

    policy.check_origin(headers.get(variant.origin_header()))?;

    let subprotocol = policy.select_subprotocol(headers.tokens(SEC_WEBSOCKET_PROTOCOL));

    let (accepted, extensions) = match headers.get_joined(SEC_WEBSOCKET_EXTENSIONS) {
        Some(value) if variant.supports_extensions() => {
            negotiate_server(&ExtensionOffer::parse_header(&value), &policy.extensions)
        }
        _ => (Vec::new(), ExtensionPipeline::new()),
    };

    let mut response = variant.accept_response(request, &key, policy.secure);
    if let Some(protocol) = &subprotocol {
        response.headers.append(SEC_WEBSOCKET_PROTOCOL, protocol.as_str());
    }
    if !accepted.is_empty() {
        response
            .headers
            .append(SEC_WEBSOCKET_EXTENSIONS, ExtensionOffer::format_header(&accepted));
    }

    tracing::debug!(
        target = %request.target,
        ?variant,
        subprotocol = subprotocol.as_deref().unwrap_or(""),
        extensions = accepted.len(),
        "upgrade accepted"
    );

    Ok(ServerHandshake {
        response,
        params: NegotiatedParams {
            subprotocol,
            extensions: accepted,
            variant,
        },
        extensions,
    })
}

impl HandshakeError {
    /// HTTP response reporting this failure to the client
    ///
    /// - unsupported version: `426 Upgrade Required` listing supported versions
    /// - rejected origin: `403 Forbidden`
    /// - anything else: `400 Bad Request`
    pub fn to_response(&self) -> HandshakeResponse {
        let mut response = match self {
            HandshakeError::UnsupportedVersion(_) => {
                let mut response = HandshakeResponse::new(426);
                response.headers.append(SEC_WEBSOCKET_VERSION, SUPPORTED_VERSIONS);
                response
            }
            HandshakeError::OriginRejected(_) => HandshakeResponse::new(403),
            _ => HandshakeResponse::new(400),
        };
        let body = self.to_string();
        response.headers.append("Content-Type", "text/plain");
        response.headers.append("Content-Length", body.len().to_string());
        response.headers.append(CONNECTION, "close");
        response.body = Bytes::from(body);
        response
    }
}

// ============================================================================
// Async driver
// ============================================================================

/// Run the server side of the handshake over `stream`
///
/// On a rejected request the error response is written before the error is
/// returned.
pub async fn server_handshake<S>(stream: &mut S, policy: &ServerPolicy) -> Result<Upgraded>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    let (request, consumed) = read_message(stream, &mut buf, parse_request).await?;

    match build_server_response(&request, policy) {
        Ok(accepted) => {
            stream.write_all(&accepted.response.to_bytes()).await?;
            stream.flush().await?;
            let leftover = buf.split_off(consumed).freeze();
            Ok(Upgraded {
                params: accepted.params,
                extensions: accepted.extensions,
                target: request.target,
                leftover,
            })
        }
        Err(err) => {
            tracing::debug!(error = %err, target = %request.target, "upgrade rejected");
            stream.write_all(&err.to_response().to_bytes()).await?;
            stream.flush().await?;
            Err(err.into())
        }
    }
}
