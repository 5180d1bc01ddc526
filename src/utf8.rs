//! UTF-8 validation for text messages
//!
//! Text payloads are validated as they arrive so that an invalid sequence is
//! detected on the fragment that carries it, not when the message completes.
//! A code point split across a fragment boundary is carried over to the next
//! fragment.

use simdutf8::compat::from_utf8;

// ============================================================================
// One-shot validation
// ============================================================================

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

// ============================================================================
// Streaming validation (for fragmented messages)
// ============================================================================

/// Width of a UTF-8 sequence from its leading byte
#[inline]
fn sequence_width(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

/// Incremental validator for text split across frames
#[derive(Debug, Default, Clone)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    /// Create a validator with no carried-over bytes
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of a text message
    ///
    /// Returns `false` as soon as the bytes seen so far cannot be the prefix of
    /// valid UTF-8.
    pub fn feed(&mut self, data: &[u8]) -> bool {
        let mut input = data;

        if self.pending_len > 0 {
            let need = sequence_width(self.pending[0]) - self.pending_len;
            let take = need.min(input.len());
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&input[..take]);
            self.pending_len += take;
            input = &input[take..];

            match from_utf8(&self.pending[..self.pending_len]) {
                Ok(_) => self.pending_len = 0,
                Err(e) if e.error_len().is_some() => return false,
                // Still incomplete, and the chunk is exhausted
                Err(_) => return true,
            }
        }

        match from_utf8(input) {
            Ok(_) => true,
            Err(e) => match e.error_len() {
                Some(_) => false,
                None => {
                    let tail = &input[e.valid_up_to()..];
                    self.pending[..tail.len()].copy_from_slice(tail);
                    self.pending_len = tail.len();
                    true
                }
            },
        }
    }

    /// Validate a chunk and return the text it completes
    ///
    /// A code point cut by the end of `data` is held back and prepended to the
    /// text of the next chunk. Returns `None` on invalid UTF-8.
    pub fn decode_chunk(&mut self, data: &[u8]) -> Option<String> {
        let mut joined = Vec::with_capacity(self.pending_len + data.len());
        joined.extend_from_slice(&self.pending[..self.pending_len]);
        joined.extend_from_slice(data);
        self.pending_len = 0;

        let valid = match from_utf8(&joined) {
            Ok(text) => return Some(text.to_owned()),
            Err(e) if e.error_len().is_some() => return None,
            Err(e) => e.valid_up_to(),
        };
        let tail = &joined[valid..];
        self.pending[..tail.len()].copy_from_slice(tail);
        self.pending_len = tail.len();
        simdutf8::basic::from_utf8(&joined[..valid]).ok().map(str::to_owned)
    }

    /// Whether the message may end here (no partial code point pending)
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.pending_len == 0
    }

    /// Drop carried-over bytes for the next message
    #[inline]
    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}
