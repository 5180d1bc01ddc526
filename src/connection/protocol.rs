//! Per-connection protocol state
//!
//! [`ConnectionCore`] is synchronous: it turns inbound frames into events and
//! automatic replies, and outbound requests into encoded bytes. The session
//! keeps it behind a mutex and does all I/O itself.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::state::{CloseHandshake, ConnectionState, wire_close_code};
use crate::error::{CloseCode, CloseReason, Error, FrameError, ProtocolError, Result};
use crate::extension::ExtensionPipeline;
use crate::frame::{self, DecodeLimits, Frame, OpCode, legacy};
use crate::handshake::HandshakeVariant;
use crate::mask::{MaskGenerator, RandomMask};
use crate::utf8::Utf8Validator;
use crate::{Config, MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE, Role};

/// Something the application must be told about
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Text(String),
    Binary(Bytes),
    TextFragment { text: String, last: bool },
    BinaryFragment { data: Bytes, last: bool },
    Ping(Bytes),
    Pong(Bytes),
}

/// Result of processing one inbound frame
#[derive(Debug, Default)]
pub(crate) struct Inbound {
    pub event: Option<Event>,
    /// Automatic pong or close echo, already encoded
    pub reply: Option<Bytes>,
    /// The reply is our close frame
    pub reply_is_close: bool,
}

/// Message being reassembled from fragments
struct PartialMessage {
    opcode: OpCode,
    data: BytesMut,
    utf8: Utf8Validator,
}

pub(crate) struct ConnectionCore {
    role: Role,
    variant: HandshakeVariant,
    state: ConnectionState,
    limits: DecodeLimits,
    max_frame_size: usize,
    max_message_size: usize,
    stream_fragments: bool,
    extensions: ExtensionPipeline,
    masks: Arc<dyn MaskGenerator>,
    /// Inbound message in progress
    message: Option<PartialMessage>,
    /// Data type of the outbound fragmented message in progress
    sending: Option<OpCode>,
    close: CloseHandshake,
}

impl ConnectionCore {
    pub fn new(
        role: Role,
        variant: HandshakeVariant,
        extensions: ExtensionPipeline,
        config: &Config,
    ) -> Self {
        let limits =
            DecodeLimits::for_role(role, config.max_frame_size).with_rsv(extensions.rsv_bits());
        Self {
            role,
            variant,
            state: ConnectionState::Connecting,
            limits,
            max_frame_size: config.max_frame_size,
            max_message_size: config.max_message_size,
            stream_fragments: config.stream_fragments,
            extensions,
            masks: Arc::new(RandomMask),
            message: None,
            sending: None,
            close: CloseHandshake::default(),
        }
    }

    pub fn set_mask_generator(&mut self, masks: Arc<dyn MaskGenerator>) {
        self.masks = masks;
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn extension_names(&self) -> Vec<String> {
        self.extensions.names().into_iter().map(str::to_string).collect()
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state.can_transition_to(next) {
            tracing::debug!(
                role = ?self.role,
                from = %self.state,
                to = %next,
                "connection state change"
            );
            self.state = next;
        }
    }

    pub fn open(&mut self) {
        self.transition(ConnectionState::Open);
    }

    pub fn mark_closed(&mut self) {
        self.message = None;
        self.sending = None;
        self.transition(ConnectionState::Closed);
    }

    pub fn mark_close_flushed(&mut self) {
        self.close.flushed = true;
    }

    pub fn close_sent(&self) -> bool {
        self.close.sent.is_some()
    }

    pub fn close_received(&self) -> bool {
        self.close.received.is_some()
    }

    pub fn close_flushed(&self) -> bool {
        self.close.flushed
    }

    pub fn close_complete(&self) -> bool {
        self.close.is_complete()
    }

    /// Close reason `on_close` reports, if a close frame went either way
    pub fn first_close(&self) -> Option<CloseReason> {
        self.close.first.clone()
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Decode the next frame from the read buffer
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Frame, usize)>> {
        let decoded = if self.variant.uses_legacy_framing() {
            legacy::decode(buf, self.max_frame_size)?
        } else {
            frame::decode(buf, &self.limits)?
        };
        Ok(decoded)
    }

    /// Process one decoded frame
    pub fn on_frame(&mut self, frame: Frame) -> Result<Inbound> {
        if self.state.is_closed() || self.close.received.is_some() {
            tracing::trace!(opcode = ?frame.opcode, "dropping frame after close");
            return Ok(Inbound::default());
        }
        if frame.is_control() {
            return self.on_control(frame);
        }
        let frame = if self.variant.uses_legacy_framing() {
            frame
        } else {
            self.extensions.incoming(frame)?
        };
        self.on_data(frame)
    }

    fn on_data(&mut self, frame: Frame) -> Result<Inbound> {
        match (frame.opcode, self.message.is_some()) {
            (OpCode::Continuation, false) => {
                return Err(ProtocolError::UnexpectedContinuation.into());
            }
            (OpCode::Text | OpCode::Binary, true) => {
                return Err(ProtocolError::NestedMessage.into());
            }
            _ => {}
        }

        // Unfragmented message
        if frame.fin && frame.opcode != OpCode::Continuation {
            if frame.payload.len() > self.max_message_size {
                return Err(Error::MessageTooLarge);
            }
            let event = match frame.opcode {
                OpCode::Text => Event::Text(into_text(&frame.payload)?),
                _ => Event::Binary(frame.payload),
            };
            return Ok(Inbound {
                event: Some(event),
                ..Inbound::default()
            });
        }

        if frame.opcode != OpCode::Continuation {
            self.message = Some(PartialMessage {
                opcode: frame.opcode,
                data: BytesMut::new(),
                utf8: Utf8Validator::new(),
            });
        }
        if self.stream_fragments {
            return self.on_fragment(frame);
        }
        let Some(message) = self.message.as_mut() else {
            return Err(ProtocolError::UnexpectedContinuation.into());
        };

        if message.data.len() + frame.payload.len() > self.max_message_size {
            return Err(Error::MessageTooLarge);
        }
        if message.opcode == OpCode::Text && !message.utf8.feed(&frame.payload) {
            return Err(Error::InvalidUtf8);
        }
        message.data.extend_from_slice(&frame.payload);

        if !frame.fin {
            return Ok(Inbound::default());
        }

        let Some(message) = self.message.take() else {
            return Err(ProtocolError::UnexpectedContinuation.into());
        };
        let event = match message.opcode {
            OpCode::Text => {
                if !message.utf8.is_complete() {
                    return Err(Error::InvalidUtf8);
                }
                Event::Text(into_text(&message.data)?)
            }
            _ => Event::Binary(message.data.freeze()),
        };
        Ok(Inbound {
            event: Some(event),
            ..Inbound::default()
        })
    }

    /// Hand one piece of a fragmented message straight to the application
    fn on_fragment(&mut self, frame: Frame) -> Result<Inbound> {
        let Some(message) = self.message.as_mut() else {
            return Err(ProtocolError::UnexpectedContinuation.into());
        };
        let last = frame.fin;
        let event = match message.opcode {
            OpCode::Text => {
                let text = message
                    .utf8
                    .decode_chunk(&frame.payload)
                    .ok_or(Error::InvalidUtf8)?;
                if last && !message.utf8.is_complete() {
                    return Err(Error::InvalidUtf8);
                }
                Event::TextFragment { text, last }
            }
            _ => Event::BinaryFragment {
                data: frame.payload,
                last,
            },
        };
        if last {
            self.message = None;
        }
        Ok(Inbound {
            event: Some(event),
            ..Inbound::default()
        })
    }

    fn on_control(&mut self, frame: Frame) -> Result<Inbound> {
        match frame.opcode {
            OpCode::Ping => {
                // No pong once our close frame is out
                let reply = if self.close.sent.is_none() && !self.variant.uses_legacy_framing() {
                    Some(self.encode_frame(Frame::pong(frame.payload.clone()))?)
                } else {
                    None
                };
                Ok(Inbound {
                    event: Some(Event::Ping(frame.payload)),
                    reply,
                    reply_is_close: false,
                })
            }
            OpCode::Pong => Ok(Inbound {
                event: Some(Event::Pong(frame.payload)),
                ..Inbound::default()
            }),
            _ => self.on_close_frame(frame),
        }
    }

    fn on_close_frame(&mut self, frame: Frame) -> Result<Inbound> {
        let parsed = frame.parse_close()?;
        if let Some(peer) = &parsed {
            let reserved_for_servers =
                matches!(peer.code, CloseCode::ServiceRestart | CloseCode::TryAgainLater);
            if self.role == Role::Server && reserved_for_servers {
                return Err(ProtocolError::InvalidCloseCode(peer.code.as_u16()).into());
            }
        }

        let reason = parsed
            .clone()
            .unwrap_or_else(|| CloseReason::new(CloseCode::NoStatus, ""));
        tracing::debug!(role = ?self.role, code = %reason.code, "close frame received");
        self.message = None;
        self.close.record_received(reason.clone());

        let mut inbound = Inbound::default();
        if self.close.sent.is_none() {
            let echo = match &parsed {
                Some(peer) => Frame::close(peer.code, ""),
                None => Frame::close_empty(),
            };
            inbound.reply = Some(self.encode_frame(echo)?);
            inbound.reply_is_close = true;
            self.close.record_sent(reason);
        }
        self.transition(ConnectionState::Closing);
        Ok(inbound)
    }

    /// Start failing the connection after a protocol violation
    ///
    /// Returns the close frame to send, unless one was already sent.
    pub fn fail(&mut self, err: &Error) -> Option<Bytes> {
        self.message = None;
        let can_close = matches!(self.state, ConnectionState::Open | ConnectionState::Closing);
        if self.close.sent.is_some() || !can_close {
            return None;
        }
        let reason = CloseReason::from_error(err);
        tracing::debug!(role = ?self.role, code = %reason.code, error = %err, "failing connection");
        let frame = Frame::close(wire_close_code(self.role, reason.code), &reason.reason);
        match self.encode_frame(frame) {
            Ok(bytes) => {
                self.close.record_sent(reason);
                self.transition(ConnectionState::Closing);
                Some(bytes)
            }
            Err(encode_err) => {
                tracing::warn!(
                    role = ?self.role,
                    error = %encode_err,
                    "could not encode close frame"
                );
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    fn ensure_open(&self) -> Result<()> {
        if self.state.can_send() {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    /// Run a frame through the extensions and encode it for the wire
    fn encode_frame(&mut self, mut frame: Frame) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(frame.payload.len() + MAX_FRAME_HEADER_SIZE);
        if self.variant.uses_legacy_framing() {
            legacy::encode_into(&frame, &mut buf)?;
        } else {
            frame = self.extensions.outgoing(frame)?;
            if self.role == Role::Client {
                frame.mask = Some(self.masks.next_mask());
            }
            frame::encode_into(&frame, &mut buf);
        }
        Ok(buf.freeze())
    }

    /// Encode a complete text or binary message
    pub fn encode_message(&mut self, opcode: OpCode, payload: Bytes) -> Result<Bytes> {
        self.ensure_open()?;
        if self.sending.is_some() {
            return Err(ProtocolError::NestedMessage.into());
        }
        self.encode_frame(Frame::new(opcode, payload, true))
    }

    /// Encode one piece of a streamed message
    ///
    /// The first piece carries `opcode`, later ones are continuations. Mixing
    /// data types before the last piece fails with `NestedMessage`.
    pub fn encode_fragment(
        &mut self,
        opcode: OpCode,
        payload: Bytes,
        last: bool,
    ) -> Result<Bytes> {
        self.ensure_open()?;
        let frame_opcode = match self.sending {
            None => opcode,
            Some(open) if open == opcode => OpCode::Continuation,
            Some(_) => return Err(ProtocolError::NestedMessage.into()),
        };
        let bytes = self.encode_frame(Frame::new(frame_opcode, payload, last))?;
        self.sending = if last { None } else { Some(opcode) };
        Ok(bytes)
    }

    /// Encode a ping or pong
    pub fn encode_control(&mut self, opcode: OpCode, payload: Bytes) -> Result<Bytes> {
        self.ensure_open()?;
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlFrameTooLarge.into());
        }
        self.encode_frame(Frame::new(opcode, payload, true))
    }

    /// Encode our close frame
    ///
    /// `Ok(None)` when a close frame was already sent.
    pub fn encode_close(&mut self, reason: CloseReason) -> Result<Option<Bytes>> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed);
            }
            ConnectionState::Closing if self.close.sent.is_some() => return Ok(None),
            _ => {}
        }
        let reason = CloseReason::new(reason.code, reason.reason);
        let wire = wire_close_code(self.role, reason.code);
        let bytes = self.encode_frame(Frame::close(wire, &reason.reason))?;
        tracing::debug!(
            role = ?self.role,
            code = %reason.code,
            wire = %wire,
            "sending close frame"
        );
        self.close.record_sent(reason);
        self.transition(ConnectionState::Closing);
        Ok(Some(bytes))
    }
}

fn into_text(payload: &[u8]) -> Result<String> {
    simdutf8::basic::from_utf8(payload)
        .map(str::to_owned)
        .map_err(|_| Error::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mask::FixedMask;

    fn core(role: Role) -> ConnectionCore {
        core_with(role, HandshakeVariant::Rfc6455, &Config::default())
    }

    fn core_with(role: Role, variant: HandshakeVariant, config: &Config) -> ConnectionCore {
        let mut core = ConnectionCore::new(role, variant, ExtensionPipeline::new(), config);
        core.open();
        core
    }

    fn masked(frame: Frame) -> Frame {
        frame.with_mask([1, 2, 3, 4])
    }

    fn decode_reply(bytes: &Bytes) -> Frame {
        let (frame, used) = frame::decode(bytes, &DecodeLimits::default()).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        frame
    }

    #[test]
    fn test_three_frame_reassembly() {
        let mut core = core(Role::Server);
        let first = core.on_frame(masked(Frame::new(OpCode::Text, "Hel", false))).unwrap();
        assert!(first.event.is_none());
        core.on_frame(masked(Frame::continuation("lo ", false))).unwrap();
        let last = core.on_frame(masked(Frame::continuation("World", true))).unwrap();
        assert_eq!(last.event, Some(Event::Text("Hello World".into())));
    }

    #[test]
    fn test_control_frame_between_fragments() {
        let mut core = core(Role::Server);
        core.on_frame(Frame::new(OpCode::Binary, vec![1u8, 2], false)).unwrap();
        let ping = core.on_frame(Frame::ping("p")).unwrap();
        assert_eq!(ping.event, Some(Event::Ping(Bytes::from_static(b"p"))));
        let done = core.on_frame(Frame::continuation(vec![3u8], true)).unwrap();
        assert_eq!(done.event, Some(Event::Binary(Bytes::from_static(&[1, 2, 3]))));
    }

    #[test]
    fn test_sequence_errors() {
        let mut core = core(Role::Server);
        assert!(matches!(
            core.on_frame(Frame::continuation("x", true)),
            Err(Error::Protocol(ProtocolError::UnexpectedContinuation))
        ));
        core.on_frame(Frame::new(OpCode::Text, "a", false)).unwrap();
        assert!(matches!(
            core.on_frame(Frame::text("b")),
            Err(Error::Protocol(ProtocolError::NestedMessage))
        ));
    }

    #[test]
    fn test_utf8_split_across_fragments() {
        let mut core = core(Role::Server);
        let euro = "€".as_bytes();
        core.on_frame(Frame::new(OpCode::Text, euro[..1].to_vec(), false)).unwrap();
        let done = core.on_frame(Frame::continuation(euro[1..].to_vec(), true)).unwrap();
        assert_eq!(done.event, Some(Event::Text("€".into())));

        core.on_frame(Frame::new(OpCode::Text, vec![b'o', b'k'], false)).unwrap();
        let err = core.on_frame(Frame::continuation(vec![0xC0, 0x80], false)).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::InvalidPayload);
    }

    #[test]
    fn test_truncated_code_point_at_end() {
        let mut core = core(Role::Server);
        core.on_frame(Frame::new(OpCode::Text, vec![0xE2, 0x82], false)).unwrap();
        assert!(matches!(
            core.on_frame(Frame::continuation(Bytes::new(), true)),
            Err(Error::InvalidUtf8)
        ));
    }

    #[test]
    fn test_message_too_large() {
        let config = Config::builder().max_message_size(4).build();
        let mut core = core_with(Role::Server, HandshakeVariant::Rfc6455, &config);
        core.on_frame(Frame::new(OpCode::Binary, vec![0u8; 3], false)).unwrap();
        let err = core.on_frame(Frame::continuation(vec![0u8; 2], true)).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::MessageTooBig);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut core = core(Role::Server);
        let inbound = core.on_frame(masked(Frame::ping("hb"))).unwrap();
        let pong = decode_reply(&inbound.reply.unwrap());
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload.as_ref(), b"hb");
        assert!(pong.mask.is_none());
    }

    #[test]
    fn test_client_replies_are_masked() {
        let mut core = core(Role::Client);
        core.set_mask_generator(Arc::new(FixedMask([9, 9, 9, 9])));
        let inbound = core.on_frame(Frame::ping("x")).unwrap();
        let pong = decode_reply(&inbound.reply.unwrap());
        assert_eq!(pong.mask, Some([9, 9, 9, 9]));
        assert_eq!(pong.payload.as_ref(), b"x");
    }

    #[test]
    fn test_peer_close_is_echoed() {
        let mut core = core(Role::Server);
        let inbound = core.on_frame(Frame::close(CloseCode::Other(4000), "bye")).unwrap();
        assert!(inbound.reply_is_close);
        let echo = decode_reply(&inbound.reply.unwrap());
        assert_eq!(echo.parse_close().unwrap().map(|r| r.code), Some(CloseCode::Other(4000)));
        assert_eq!(core.state(), ConnectionState::Closing);
        assert_eq!(core.first_close().map(|r| r.code), Some(CloseCode::Other(4000)));

        assert!(matches!(
            core.encode_message(OpCode::Text, "late".into()),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_empty_close_reports_no_status() {
        let mut core = core(Role::Client);
        let inbound = core.on_frame(Frame::close_empty()).unwrap();
        let echo = decode_reply(&inbound.reply.unwrap());
        assert!(echo.payload.is_empty());
        assert_eq!(core.first_close().map(|r| r.code), Some(CloseCode::NoStatus));
    }

    #[test]
    fn test_local_close_then_peer_reply() {
        let mut core = core(Role::Server);
        let sent = core.encode_close(CloseReason::normal()).unwrap();
        assert!(sent.is_some());
        assert!(core.encode_close(CloseReason::normal()).unwrap().is_none());

        let inbound = core.on_frame(Frame::close(CloseCode::Normal, "")).unwrap();
        assert!(inbound.reply.is_none());
        core.mark_close_flushed();
        assert!(core.close_complete());
    }

    #[test]
    fn test_server_rejects_reserved_codes_from_client() {
        let mut core = core(Role::Server);
        let err = core
            .on_frame(masked(Frame::close(CloseCode::TryAgainLater, "")))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::InvalidCloseCode(1013))));

        let mut client = self::core(Role::Client);
        assert!(client.on_frame(Frame::close(CloseCode::TryAgainLater, "")).is_ok());
    }

    #[test]
    fn test_invalid_close_payloads() {
        let mut core = core(Role::Client);
        let one_byte = Frame::new(OpCode::Close, vec![0x03], true);
        let err = core.on_frame(one_byte).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::ProtocolError);

        let mut core = self::core(Role::Client);
        let bad_reason = Frame::new(OpCode::Close, vec![0x03, 0xE8, 0xFF], true);
        let err = core.on_frame(bad_reason).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
    }

    #[test]
    fn test_outbound_close_code_normalised() {
        let mut core = core(Role::Client);
        let bytes = core
            .encode_close(CloseReason::new(CloseCode::ServiceRestart, "restart"))
            .unwrap()
            .unwrap();
        let frame = decode_reply(&bytes);
        assert_eq!(frame.parse_close().unwrap().map(|r| r.code), Some(CloseCode::Normal));
        assert_eq!(core.first_close().map(|r| r.code), Some(CloseCode::ServiceRestart));
    }

    #[test]
    fn test_fragmented_send() {
        let mut core = core(Role::Server);
        let first = decode_reply(&core.encode_fragment(OpCode::Text, "a".into(), false).unwrap());
        assert_eq!((first.opcode, first.fin), (OpCode::Text, false));

        assert!(matches!(
            core.encode_fragment(OpCode::Binary, "b".into(), true),
            Err(Error::Protocol(ProtocolError::NestedMessage))
        ));
        assert!(matches!(
            core.encode_message(OpCode::Text, "c".into()),
            Err(Error::Protocol(ProtocolError::NestedMessage))
        ));

        let last = decode_reply(&core.encode_fragment(OpCode::Text, "d".into(), true).unwrap());
        assert_eq!((last.opcode, last.fin), (OpCode::Continuation, true));
        assert!(core.encode_message(OpCode::Binary, "e".into()).is_ok());
    }

    #[test]
    fn test_oversized_ping_rejected() {
        let mut core = core(Role::Server);
        assert!(matches!(
            core.encode_control(OpCode::Ping, Bytes::from(vec![0u8; 126])),
            Err(Error::Frame(FrameError::ControlFrameTooLarge))
        ));
    }

    #[test]
    fn test_rsv1_without_extension_rejected() {
        let core = core(Role::Client);
        let err = core.decode(&[0xC1, 0x01, b'x']).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
    }

    #[test]
    fn test_legacy_session() {
        let mut core = core_with(Role::Server, HandshakeVariant::Hixie76, &Config::default());
        let (frame, used) = core.decode(b"\x00hi\xff").unwrap().unwrap();
        assert_eq!(used, 4);
        let inbound = core.on_frame(frame).unwrap();
        assert_eq!(inbound.event, Some(Event::Text("hi".into())));

        let encoded = core.encode_message(OpCode::Text, "yo".into()).unwrap();
        assert_eq!(encoded.as_ref(), b"\x00yo\xff");
        assert!(matches!(
            core.encode_message(OpCode::Binary, "b".into()),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            core.encode_control(OpCode::Ping, Bytes::new()),
            Err(Error::Unsupported(_))
        ));
        let close = core.encode_close(CloseReason::normal()).unwrap().unwrap();
        assert_eq!(close.as_ref(), b"\xff\x00");
    }

    #[test]
    fn test_streamed_fragments_delivered_as_they_arrive() {
        let config = Config::builder()
            .stream_fragments(true)
            .max_message_size(4)
            .build();
        let mut core = core_with(Role::Server, HandshakeVariant::Rfc6455, &config);
        let euro = "€".as_bytes();

        let first = core
            .on_frame(Frame::new(OpCode::Text, vec![b'a', euro[0]], false))
            .unwrap();
        let expected = Event::TextFragment {
            text: "a".into(),
            last: false,
        };
        assert_eq!(first.event, Some(expected));
        let last = core.on_frame(Frame::continuation(euro[1..].to_vec(), true)).unwrap();
        let expected = Event::TextFragment {
            text: "€".into(),
            last: true,
        };
        assert_eq!(last.event, Some(expected));

        // Nothing is buffered, so pieces beyond the message cap still pass
        let head = core.on_frame(Frame::new(OpCode::Binary, vec![0u8; 3], false)).unwrap();
        assert!(matches!(head.event, Some(Event::BinaryFragment { last: false, .. })));
        let tail = core.on_frame(Frame::continuation(vec![1u8; 3], true)).unwrap();
        assert!(matches!(tail.event, Some(Event::BinaryFragment { last: true, .. })));

        let whole = core.on_frame(Frame::text("ok")).unwrap();
        assert_eq!(whole.event, Some(Event::Text("ok".into())));
    }

    #[test]
    fn test_streamed_text_still_validated() {
        let config = Config::builder().stream_fragments(true).build();
        let mut core = core_with(Role::Server, HandshakeVariant::Rfc6455, &config);
        core.on_frame(Frame::new(OpCode::Text, "fine", false)).unwrap();
        let err = core.on_frame(Frame::continuation(vec![0xC0, 0x80], false)).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::InvalidPayload);

        let mut core = core_with(Role::Server, HandshakeVariant::Rfc6455, &config);
        core.on_frame(Frame::new(OpCode::Text, vec![0xE2, 0x82], false)).unwrap();
        let err = core.on_frame(Frame::continuation(Bytes::new(), true)).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::InvalidPayload);
    }

    #[test]
    fn test_fail_sends_close_once() {
        let mut core = core(Role::Server);
        let bytes = core.fail(&Error::InvalidUtf8).unwrap();
        let close = decode_reply(&bytes);
        let code = close.parse_close().unwrap().map(|r| r.code);
        assert_eq!(code, Some(CloseCode::InvalidPayload));
        assert!(core.close_sent());
        assert_eq!(core.state(), ConnectionState::Closing);
        assert!(core.fail(&Error::InvalidUtf8).is_none());
    }

    #[cfg(feature = "permessage-deflate")]
    fn deflate_core() -> ConnectionCore {
        use crate::extension::ExtensionProvider;
        use crate::extension::deflate::DeflateProvider;

        let provider = DeflateProvider::default();
        let (_, stage) = provider.accept(&provider.offer(), Role::Server).unwrap();
        let mut extensions = ExtensionPipeline::new();
        extensions.push(stage);
        let config = Config::default();
        let variant = HandshakeVariant::Rfc6455;
        let mut core = ConnectionCore::new(Role::Server, variant, extensions, &config);
        core.open();
        core
    }

    #[cfg(feature = "permessage-deflate")]
    #[test]
    fn test_rsv1_on_ping_rejected_under_deflate() {
        let core = deflate_core();
        // Masked, empty ping with RSV1
        let err = core.decode(&[0xC9, 0x80, 1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, Error::Frame(FrameError::ReservedBitsSet)));
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
    }

    #[cfg(feature = "permessage-deflate")]
    #[test]
    fn test_rsv1_on_continuation_rejected_under_deflate() {
        let mut core = deflate_core();
        core.on_frame(masked(Frame::new(OpCode::Text, "plain ", false))).unwrap();
        let mut next = masked(Frame::continuation("text", true));
        next.rsv1 = true;
        let err = core.on_frame(next).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::ProtocolError);
    }
}
