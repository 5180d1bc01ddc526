//! draft-hixie-76 challenge/response
//!
//! Each of `Sec-WebSocket-Key1/Key2` encodes a number as its digits divided by
//! its space count. The answer is the MD5 of both numbers (big-endian u32)
//! followed by the 8-byte request body.

use md5::{Digest, Md5};

use super::{SEC_WEBSOCKET_KEY1, SEC_WEBSOCKET_KEY2};
use crate::error::HandshakeError;

/// Decode the number carried by a key header
pub fn key_number(value: &str, header: &'static str) -> Result<u32, HandshakeError> {
    let spaces = value.bytes().filter(|&b| b == b' ').count() as u64;
    let digits: String = value.chars().filter(char::is_ascii_digit).collect();
    if spaces == 0 || digits.is_empty() {
        return Err(HandshakeError::InvalidHeader(header));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| HandshakeError::InvalidHeader(header))?;
    if number % spaces != 0 {
        return Err(HandshakeError::InvalidHeader(header));
    }
    u32::try_from(number / spaces).map_err(|_| HandshakeError::InvalidHeader(header))
}

/// MD5 challenge answer for the two key numbers and the 8-byte body
pub fn challenge_response(key1: u32, key2: u32, key3: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(key1.to_be_bytes());
    hasher.update(key2.to_be_bytes());
    hasher.update(key3);
    hasher.finalize().into()
}

/// Compute the answer straight from the request header values
pub fn respond(key1: &str, key2: &str, key3: &[u8]) -> Result<[u8; 16], HandshakeError> {
    let n1 = key_number(key1, SEC_WEBSOCKET_KEY1)?;
    let n2 = key_number(key2, SEC_WEBSOCKET_KEY2)?;
    Ok(challenge_response(n1, n2, key3))
}

/// Client side: generate a key header value and the number it encodes
pub fn generate_key() -> (String, u32) {
    let spaces = fastrand::u32(1..=12);
    let number = fastrand::u32(0..=u32::MAX / spaces);
    let mut chars: Vec<char> = (u64::from(number) * u64::from(spaces))
        .to_string()
        .chars()
        .collect();

    // Noise from U+0021..U+002F and U+003A..U+007E
    for _ in 0..fastrand::usize(1..=12) {
        let noise = if fastrand::bool() {
            fastrand::u8(0x21..=0x2F)
        } else {
            fastrand::u8(0x3A..=0x7E)
        };
        let at = fastrand::usize(0..=chars.len());
        chars.insert(at, char::from(noise));
    }

    // Spaces never first or last
    for _ in 0..spaces {
        let at = fastrand::usize(1..chars.len());
        chars.insert(at, ' ');
    }

    (chars.into_iter().collect(), number)
}

/// Client side: 8 random body bytes
pub fn generate_key3() -> [u8; 8] {
    let mut key3 = [0u8; 8];
    fastrand::fill(&mut key3);
    key3
}
