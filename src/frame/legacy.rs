//! Sentinel framing for draft-hixie-76 sessions
//!
//! - text: `0x00 <utf-8 bytes> 0xFF`
//! - close: `0xFF 0x00`
//!
//! Binary and control frames have no representation here.

use bytes::{BufMut, Bytes, BytesMut};

use super::{Frame, OpCode};
use crate::error::{Error, FrameError, Result};

const TEXT_START: u8 = 0x00;
const TEXT_END: u8 = 0xFF;
const CLOSE: [u8; 2] = [0xFF, 0x00];

/// Decode one legacy frame from the front of `buf`
///
/// Same contract as [`super::decode`]: `Ok(None)` until a complete frame is
/// buffered. `max_payload` bounds how much text may accumulate before the
/// terminating sentinel arrives.
pub fn decode(
    buf: &[u8],
    max_payload: usize,
) -> std::result::Result<Option<(Frame, usize)>, FrameError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    match first {
        TEXT_START => match buf[1..].iter().position(|&b| b == TEXT_END) {
            Some(end) => {
                let payload = Bytes::copy_from_slice(&buf[1..1 + end]);
                Ok(Some((Frame::text(payload), end + 2)))
            }
            None if buf.len() - 1 > max_payload => {
                Err(FrameError::OversizedPayload((buf.len() - 1) as u64))
            }
            None => Ok(None),
        },
        TEXT_END => match buf.get(1) {
            None => Ok(None),
            Some(0x00) => Ok(Some((Frame::close_empty(), 2))),
            Some(_) => Err(FrameError::InvalidOpcode(first)),
        },
        other => Err(FrameError::InvalidOpcode(other)),
    }
}

/// Encode a frame for a legacy session
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<()> {
    match frame.opcode {
        OpCode::Text if frame.fin => {
            buf.reserve(frame.payload.len() + 2);
            buf.put_u8(TEXT_START);
            buf.put_slice(&frame.payload);
            buf.put_u8(TEXT_END);
            Ok(())
        }
        OpCode::Close => {
            buf.put_slice(&CLOSE);
            Ok(())
        }
        OpCode::Text | OpCode::Continuation => {
            Err(Error::Unsupported("fragmented messages on a hixie-76 session"))
        }
        OpCode::Binary => Err(Error::Unsupported("binary messages on a hixie-76 session")),
        OpCode::Ping | OpCode::Pong => {
            Err(Error::Unsupported("ping/pong on a hixie-76 session"))
        }
    }
}
