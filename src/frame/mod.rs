//! WebSocket frame parsing and serialization
//!
//! RFC 6455 framing as pure functions over byte slices:
//! - [`decode`] reads one frame from the front of a buffer, or reports that
//!   more bytes are needed
//! - [`encode`] / [`encode_into`] write a frame with the minimal length form
//! - control-frame limits are enforced as soon as the 2-byte header is readable
//!
//! No connection state lives here; fragment sequencing is checked by the
//! connection core.

pub mod legacy;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseCode, CloseReason, FrameError, ProtocolError};
use crate::mask::apply_mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, Role, SMALL_MESSAGE_THRESHOLD};

/// RSV1 bit as it appears in the first header byte
pub const RSV1: u8 = 0x40;
/// RSV2 bit as it appears in the first header byte
pub const RSV2: u8 = 0x20;
/// RSV3 bit as it appears in the first header byte
pub const RSV3: u8 = 0x10;

const FIN_BIT: u8 = 0x80;
const RSV_BITS: u8 = RSV1 | RSV2 | RSV3;
const MASK_BIT: u8 = 0x80;

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete WebSocket frame
///
/// The payload is always held unmasked. `mask` records the key the frame was
/// (or will be) sent with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (permessage-deflate)
    pub rsv1: bool,
    /// RSV2
    pub rsv2: bool,
    /// RSV3
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, present iff the frame travels client to server
    pub mask: Option<[u8; 4]>,
    /// Frame payload
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>, fin: bool) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a final text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data, true)
    }

    /// Create a final binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data, true)
    }

    /// Create a continuation frame
    #[inline]
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data, fin)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data, true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data, true)
    }

    /// Create a close frame carrying a status code and reason
    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code.as_u16());
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create a close frame with an empty body
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Set the masking key
    #[inline]
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.fin
    }

    /// RSV bits in their first-byte positions
    #[inline]
    pub fn rsv_bits(&self) -> u8 {
        let mut bits = 0;
        if self.rsv1 {
            bits |= RSV1;
        }
        if self.rsv2 {
            bits |= RSV2;
        }
        if self.rsv3 {
            bits |= RSV3;
        }
        bits
    }

    /// Parse and validate a close frame body
    ///
    /// An empty body yields `None` (reported locally as 1005).
    pub fn parse_close(&self) -> Result<Option<CloseReason>, ProtocolError> {
        parse_close_payload(&self.payload)
    }
}

/// Validate a close frame body
pub fn parse_close_payload(payload: &[u8]) -> Result<Option<CloseReason>, ProtocolError> {
    match payload.len() {
        0 => Ok(None),
        1 => Err(ProtocolError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !CloseCode::is_valid_on_wire(code) {
                return Err(ProtocolError::InvalidCloseCode(code));
            }
            let reason = simdutf8::basic::from_utf8(&payload[2..])
                .map_err(|_| ProtocolError::InvalidClosePayload)?;
            Ok(Some(CloseReason::new(code, reason)))
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Limits applied while decoding
#[derive(Debug, Clone, Copy)]
pub struct DecodeLimits {
    /// Largest payload accepted for a single frame
    pub max_payload: u64,
    /// RSV bits claimed by negotiated extensions
    pub allowed_rsv: u8,
    /// Required state of the mask bit, if enforced
    pub expect_masked: Option<bool>,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_payload: 16 * 1024 * 1024,
            allowed_rsv: 0,
            expect_masked: None,
        }
    }
}

impl DecodeLimits {
    /// Limits for frames received by `role`
    ///
    /// A server requires masked frames, a client requires unmasked ones.
    pub fn for_role(role: Role, max_payload: usize) -> Self {
        Self {
            max_payload: max_payload as u64,
            allowed_rsv: 0,
            expect_masked: Some(role == Role::Server),
        }
    }

    /// Allow the given RSV bits
    pub fn with_rsv(mut self, bits: u8) -> Self {
        self.allowed_rsv = bits & RSV_BITS;
        self
    }
}

/// Decode one frame from the front of `buf`
///
/// Returns:
/// - `Ok(None)` if the buffer does not yet hold a complete frame
/// - `Ok(Some((frame, consumed)))` with the payload unmasked
/// - `Err(_)` on any framing violation
pub fn decode(buf: &[u8], limits: &DecodeLimits) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    if b0 & RSV_BITS & !limits.allowed_rsv != 0 {
        return Err(FrameError::ReservedBitsSet);
    }

    let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(FrameError::InvalidOpcode(b0 & 0x0F))?;
    let fin = b0 & FIN_BIT != 0;
    let masked = b1 & MASK_BIT != 0;
    let len_byte = b1 & 0x7F;

    // Extensions never claim RSV bits on control frames
    if opcode.is_control() && b0 & RSV_BITS != 0 {
        return Err(FrameError::ReservedBitsSet);
    }

    // Rejected before any payload is buffered
    if opcode.is_control() && (!fin || len_byte as usize > MAX_CONTROL_PAYLOAD) {
        return Err(FrameError::ControlFrameTooLarge);
    }

    if let Some(expected) = limits.expect_masked
        && expected != masked
    {
        return Err(FrameError::MaskMismatch);
    }

    let (payload_len, mut offset) = match len_byte {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                return Err(FrameError::NonMinimalLength);
            }
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(FrameError::OversizedPayload(len));
            }
            if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                return Err(FrameError::NonMinimalLength);
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    if payload_len > limits.max_payload {
        return Err(FrameError::OversizedPayload(payload_len));
    }
    let payload_len =
        usize::try_from(payload_len).map_err(|_| FrameError::OversizedPayload(payload_len))?;

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = offset + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = BytesMut::from(&buf[offset..total]);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin,
        rsv1: b0 & RSV1 != 0,
        rsv2: b0 & RSV2 != 0,
        rsv3: b0 & RSV3 != 0,
        opcode,
        mask,
        payload: payload.freeze(),
    };

    Ok(Some((frame, total)))
}

// ============================================================================
// Encoding
// ============================================================================

/// Size of the header that [`encode_into`] writes for this frame
#[inline]
pub fn header_len(payload_len: usize, masked: bool) -> usize {
    let ext = if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    };
    2 + ext + if masked { 4 } else { 0 }
}

/// Encode a frame into a fresh buffer
pub fn encode(frame: &Frame) -> Bytes {
    let capacity = header_len(frame.payload.len(), frame.mask.is_some()) + frame.payload.len();
    let mut buf = BytesMut::with_capacity(capacity);
    encode_into(frame, &mut buf);
    buf.freeze()
}

/// Encode a frame at the end of `buf`
///
/// Masked frames get their payload copied and masked in place.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) {
    let payload_len = frame.payload.len();
    buf.reserve(header_len(payload_len, frame.mask.is_some()) + payload_len);

    let mut b0 = frame.opcode as u8 | frame.rsv_bits();
    if frame.fin {
        b0 |= FIN_BIT;
    }
    buf.put_u8(b0);

    let mask_bit = if frame.mask.is_some() { MASK_BIT } else { 0 };
    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    match frame.mask {
        Some(key) => {
            buf.put_slice(&key);
            let start = buf.len();
            buf.put_slice(&frame.payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.put_slice(&frame.payload),
    }
}
