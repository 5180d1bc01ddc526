//! Error types for the WebSocket engine

use std::fmt;
use std::io;
use std::sync::Arc;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Opening handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// Malformed frame on the wire
    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),
    /// Frame sequence violates the protocol
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Invalid UTF-8 in a text message or close reason
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,
    /// Reassembled message exceeds the configured maximum
    #[error("Message too large")]
    MessageTooLarge,
    /// Connection is closing or closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),
    /// Extension failed to transform a frame
    #[error("Extension '{name}' failed: {message}")]
    Extension { name: String, message: String },
    /// Operation not available for the negotiated protocol variant
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Application callback failed
    #[error("Handler error: {0}")]
    Handler(anyhow::Error),
    /// Error shared between several completions
    #[error(transparent)]
    Shared(Arc<Error>),
}

impl Error {
    /// Close code a failure of this kind is reported with
    pub fn close_code(&self) -> CloseCode {
        match self {
            Error::Frame(_) | Error::Protocol(_) => CloseCode::ProtocolError,
            Error::InvalidUtf8 => CloseCode::InvalidPayload,
            Error::MessageTooLarge => CloseCode::MessageTooBig,
            Error::Io(_) | Error::ConnectionClosed => CloseCode::Abnormal,
            Error::Handshake(_) => CloseCode::ProtocolError,
            Error::Shared(inner) => inner.close_code(),
            Error::Compression(_)
            | Error::Extension { .. }
            | Error::Unsupported(_)
            | Error::Handler(_) => CloseCode::InternalError,
        }
    }
}

/// Errors of the opening handshake
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// Target URI is not a ws:// or wss:// URI with a host
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    /// HTTP status of the response was not 101
    #[error("expected 101 Switching Protocols, got {0}")]
    StatusError(u16),
    /// Sec-WebSocket-Accept does not match the key that was sent
    #[error("Sec-WebSocket-Accept does not match the sent key")]
    AcceptMismatch,
    /// A required header is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    /// A header is present with an unacceptable value
    #[error("invalid {0} header")]
    InvalidHeader(&'static str),
    /// Origin is not in the allow-list
    #[error("origin '{0}' rejected")]
    OriginRejected(String),
    /// Sec-WebSocket-Version names a draft we do not speak
    #[error("unsupported WebSocket version '{0}'")]
    UnsupportedVersion(String),
    /// Upgrade requests must use GET
    #[error("method must be GET")]
    MethodNotAllowed,
    /// Malformed HTTP message
    #[error("malformed HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Extension negotiation failed
    #[error("extension negotiation failed: {0}")]
    Extension(String),
}

/// Errors of the frame decoder
///
/// Each one is a protocol violation answered with close code 1002.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// An RSV bit is set that no negotiated extension claims
    #[error("reserved bits set without a negotiated extension")]
    ReservedBitsSet,
    /// Control frame longer than 125 bytes or fragmented
    #[error("control frame too large or fragmented")]
    ControlFrameTooLarge,
    /// Opcode outside the defined set
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),
    /// Payload exceeds the configured maximum
    #[error("payload of {0} bytes exceeds the configured maximum")]
    OversizedPayload(u64),
    /// Extended length used for a value that fits a shorter form
    #[error("payload length not minimally encoded")]
    NonMinimalLength,
    /// Mask bit does not match the direction of the frame
    #[error("mask bit does not match the sender role")]
    MaskMismatch,
}

/// Errors in the sequence of frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Continuation frame with no message in progress
    #[error("unexpected continuation frame")]
    UnexpectedContinuation,
    /// New data frame while a fragmented message is incomplete
    #[error("new message started before the previous one finished")]
    NestedMessage,
    /// Close frame payload is malformed
    #[error("invalid close frame payload")]
    InvalidClosePayload,
    /// Close code may not appear on the wire
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    /// Peer did not answer our close frame in time
    #[error("close handshake timed out")]
    CloseTimeout,
}

/// WebSocket close status code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1004
    Reserved,
    /// 1005, never sent on the wire
    NoStatus,
    /// 1006, never sent on the wire
    Abnormal,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    MessageTooBig,
    /// 1010
    MandatoryExtension,
    /// 1011
    InternalError,
    /// 1012
    ServiceRestart,
    /// 1013
    TryAgainLater,
    /// 1015, never sent on the wire
    TlsHandshake,
    /// Registered (3000-3999) or private (4000-4999) code, or an unknown value
    Other(u16),
}

impl CloseCode {
    /// Numeric value of the code
    pub fn as_u16(self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Reserved => 1004,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::MessageTooBig => 1009,
            CloseCode::MandatoryExtension => 1010,
            CloseCode::InternalError => 1011,
            CloseCode::ServiceRestart => 1012,
            CloseCode::TryAgainLater => 1013,
            CloseCode::TlsHandshake => 1015,
            CloseCode::Other(code) => code,
        }
    }

    /// Check if a code received on the wire is acceptable
    pub fn is_valid_on_wire(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Codes that only exist locally and must never be sent
    pub fn is_local_only(self) -> bool {
        matches!(
            self,
            CloseCode::NoStatus | CloseCode::Abnormal | CloseCode::TlsHandshake
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::GoingAway,
            1002 => CloseCode::ProtocolError,
            1003 => CloseCode::Unsupported,
            1004 => CloseCode::Reserved,
            1005 => CloseCode::NoStatus,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::InvalidPayload,
            1008 => CloseCode::PolicyViolation,
            1009 => CloseCode::MessageTooBig,
            1010 => CloseCode::MandatoryExtension,
            1011 => CloseCode::InternalError,
            1012 => CloseCode::ServiceRestart,
            1013 => CloseCode::TryAgainLater,
            1015 => CloseCode::TlsHandshake,
            other => CloseCode::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Maximum reason length so that a close payload fits a control frame
pub const MAX_CLOSE_REASON_LEN: usize = 123;

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: CloseCode,
    /// Optional reason string (at most 123 bytes)
    pub reason: String,
}

impl CloseReason {
    /// Create a new close reason, truncating the text at a char boundary
    pub fn new(code: impl Into<CloseCode>, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON_LEN {
            let mut end = MAX_CLOSE_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self {
            code: code.into(),
            reason,
        }
    }

    /// Normal closure without text
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// Abnormal closure (1006), used when no close frame was exchanged
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Abnormal, reason)
    }

    /// Close reason reported for a failure
    pub fn from_error(err: &Error) -> Self {
        Self::new(err.close_code(), err.to_string())
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_round_trip() {
        for raw in [1000u16, 1001, 1002, 1011, 1013, 3000, 4999] {
            assert_eq!(CloseCode::from(raw).as_u16(), raw);
        }
        assert_eq!(CloseCode::from(1002), CloseCode::ProtocolError);
        assert_eq!(CloseCode::from(4001), CloseCode::Other(4001));
    }

    #[test]
    fn test_wire_validity() {
        assert!(CloseCode::is_valid_on_wire(1000));
        assert!(CloseCode::is_valid_on_wire(4000));
        assert!(!CloseCode::is_valid_on_wire(1005));
        assert!(!CloseCode::is_valid_on_wire(1006));
        assert!(!CloseCode::is_valid_on_wire(999));
        assert!(!CloseCode::is_valid_on_wire(2999));
        assert!(!CloseCode::is_valid_on_wire(5000));
    }

    #[test]
    fn test_reason_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let reason = CloseReason::new(CloseCode::Normal, long);
        assert!(reason.reason.len() <= MAX_CLOSE_REASON_LEN);
        assert_eq!(reason.reason.len() % 2, 0);
    }

    #[test]
    fn test_error_close_codes() {
        assert_eq!(
            Error::from(FrameError::ReservedBitsSet).close_code(),
            CloseCode::ProtocolError
        );
        assert_eq!(Error::InvalidUtf8.close_code(), CloseCode::InvalidPayload);
        assert_eq!(Error::MessageTooLarge.close_code(), CloseCode::MessageTooBig);
    }
}
