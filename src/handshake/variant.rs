//! Protocol-version variants of the opening handshake

use bytes::Bytes;

use super::headers::{HandshakeRequest, HandshakeResponse};
use super::key::SecurityKey;
use super::{
    CONNECTION, HIXIE_REQUEST_BODY_LEN, ORIGIN, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_KEY1, SEC_WEBSOCKET_KEY2, SEC_WEBSOCKET_LOCATION, SEC_WEBSOCKET_ORIGIN,
    SEC_WEBSOCKET_VERSION, UPGRADE, hixie,
};
use crate::error::HandshakeError;

/// Handshake layout, selected from the request headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandshakeVariant {
    /// RFC 6455 (`Sec-WebSocket-Version: 13`)
    #[default]
    Rfc6455,
    /// hybi-07 / hybi-08 drafts: RFC framing, `Sec-WebSocket-Origin`
    Hybi {
        /// 7 or 8
        version: u8,
    },
    /// draft-hixie-76: key1/key2 challenge, sentinel framing
    Hixie76,
}

/// Key material a server answers
#[derive(Debug, Clone)]
pub(crate) enum RequestKey {
    Nonce(SecurityKey),
    Challenge([u8; 16]),
}

impl HandshakeVariant {
    /// Select the variant a request speaks
    pub fn from_request(request: &HandshakeRequest) -> Result<Self, HandshakeError> {
        let headers = &request.headers;
        match headers.get(SEC_WEBSOCKET_VERSION).map(str::trim) {
            Some("13") => Ok(Self::Rfc6455),
            Some("8") => Ok(Self::Hybi { version: 8 }),
            Some("7") => Ok(Self::Hybi { version: 7 }),
            Some(other) => Err(HandshakeError::UnsupportedVersion(other.to_string())),
            None if headers.contains(SEC_WEBSOCKET_KEY1)
                && headers.contains(SEC_WEBSOCKET_KEY2) =>
            {
                Ok(Self::Hixie76)
            }
            None => Err(HandshakeError::MissingHeader(SEC_WEBSOCKET_VERSION)),
        }
    }

    /// `Sec-WebSocket-Version` value, `None` for hixie-76
    pub fn version(&self) -> Option<u8> {
        match self {
            Self::Rfc6455 => Some(13),
            Self::Hybi { version } => Some(*version),
            Self::Hixie76 => None,
        }
    }

    /// Header carrying the browser origin
    pub fn origin_header(&self) -> &'static str {
        match self {
            Self::Hybi { .. } => SEC_WEBSOCKET_ORIGIN,
            Self::Rfc6455 | Self::Hixie76 => ORIGIN,
        }
    }

    /// Whether frames use the `0x00 .. 0xFF` sentinel format
    pub fn uses_legacy_framing(&self) -> bool {
        matches!(self, Self::Hixie76)
    }

    /// Whether `Sec-WebSocket-Extensions` is negotiated
    pub fn supports_extensions(&self) -> bool {
        !self.uses_legacy_framing()
    }

    // ------------------------------------------------------------------------
    // Server side
    // ------------------------------------------------------------------------

    /// Validate and extract the key material of a request
    pub(crate) fn request_key(
        &self,
        request: &HandshakeRequest,
    ) -> Result<RequestKey, HandshakeError> {
        let headers = &request.headers;
        match self {
            Self::Rfc6455 | Self::Hybi { .. } => {
                let value = headers
                    .get(SEC_WEBSOCKET_KEY)
                    .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_KEY))?;
                SecurityKey::from_header(value).map(RequestKey::Nonce)
            }
            Self::Hixie76 => {
                let key1 = headers
                    .get(SEC_WEBSOCKET_KEY1)
                    .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_KEY1))?;
                let key2 = headers
                    .get(SEC_WEBSOCKET_KEY2)
                    .ok_or(HandshakeError::MissingHeader(SEC_WEBSOCKET_KEY2))?;
                if request.body.len() != HIXIE_REQUEST_BODY_LEN {
                    let reason = "hixie-76 request body must be 8 bytes";
                    return Err(HandshakeError::InvalidHttp(reason));
                }
                hixie::respond(key1, key2, &request.body).map(RequestKey::Challenge)
            }
        }
    }

    /// Build the `101` response layout for this variant
    ///
    /// `secure` selects `wss` for the hixie-76 location header.
    pub(crate) fn accept_response(
        &self,
        request: &HandshakeRequest,
        key: &RequestKey,
        secure: bool,
    ) -> HandshakeResponse {
        let mut response = HandshakeResponse::switching_protocols();
        match (self, key) {
            (Self::Hixie76, RequestKey::Challenge(answer)) => {
                response.reason = "WebSocket Protocol Handshake".into();
                response.headers.append(UPGRADE, "WebSocket");
                response.headers.append(CONNECTION, "Upgrade");
                if let Some(origin) = request.headers.get(ORIGIN) {
                    response.headers.append(SEC_WEBSOCKET_ORIGIN, origin);
                }
                let host = request.headers.get(super::HOST).unwrap_or_default();
                let scheme = if secure { "wss" } else { "ws" };
                response
                    .headers
                    .append(SEC_WEBSOCKET_LOCATION, format!("{scheme}://{host}{}", request.target));
                response.body = Bytes::copy_from_slice(answer);
            }
            (_, key) => {
                response.headers.append(UPGRADE, "websocket");
                response.headers.append(CONNECTION, "Upgrade");
                if let RequestKey::Nonce(nonce) = key {
                    response.headers.append(SEC_WEBSOCKET_ACCEPT, nonce.accept());
                }
            }
        }
        response
    }
}
