//! `Sec-WebSocket-Key` nonces and their accept values

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::HandshakeError;

/// Client nonce: 16 random bytes, sent base64-encoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityKey {
    encoded: String,
}

impl SecurityKey {
    /// Fresh random key for one handshake attempt
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        fastrand::fill(&mut bytes);
        Self {
            encoded: STANDARD.encode(bytes),
        }
    }

    /// Validate a received key: base64 of exactly 16 bytes
    pub fn from_header(value: &str) -> Result<Self, HandshakeError> {
        let value = value.trim();
        match STANDARD.decode(value) {
            Ok(raw) if raw.len() == 16 => Ok(Self {
                encoded: value.to_string(),
            }),
            _ => Err(HandshakeError::InvalidHeader(super::SEC_WEBSOCKET_KEY)),
        }
    }

    /// Header form of the key
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// `Sec-WebSocket-Accept` value the server must answer with
    pub fn accept(&self) -> String {
        generate_accept_key(&self.encoded)
    }

    /// Check a received accept value, comparing the decoded digests
    pub fn verify_accept(&self, received: &str) -> bool {
        let expected = accept_digest(&self.encoded);
        match STANDARD.decode(received.trim()) {
            Ok(raw) => raw.as_slice() == expected.as_slice(),
            Err(_) => false,
        }
    }
}

fn accept_digest(key: &str) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    hasher.finalize().into()
}

/// Compute `Base64(SHA-1(key ++ GUID))`
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    STANDARD.encode(accept_digest(key))
}
