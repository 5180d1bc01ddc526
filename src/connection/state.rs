//! Connection lifecycle states and close-handshake bookkeeping

use std::fmt;

use crate::Role;
use crate::error::{CloseCode, CloseReason};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Handshake in progress
    Connecting,
    /// Messages flow both ways
    Open,
    /// A close frame was sent or received
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Whether application data may still be sent
    #[inline]
    pub fn can_send(self) -> bool {
        self == ConnectionState::Open
    }

    /// Whether the connection reached its terminal state
    #[inline]
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    /// Whether `self -> next` is a legal move
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Progress of the close handshake
#[derive(Debug, Clone, Default)]
pub(crate) struct CloseHandshake {
    /// Close requested locally, with the code the application asked for
    pub sent: Option<CloseReason>,
    /// Close received from the peer (1005 when it carried no code)
    pub received: Option<CloseReason>,
    /// Our close frame reached the transport
    pub flushed: bool,
    /// Whichever close happened first, reported to `on_close`
    pub first: Option<CloseReason>,
}

impl CloseHandshake {
    pub fn record_sent(&mut self, reason: CloseReason) {
        if self.first.is_none() {
            self.first = Some(reason.clone());
        }
        self.sent = Some(reason);
    }

    pub fn record_received(&mut self, reason: CloseReason) {
        if self.first.is_none() {
            self.first = Some(reason.clone());
        }
        self.received = Some(reason);
    }

    /// Both directions are done once our frame is written and the peer's arrived
    pub fn is_complete(&self) -> bool {
        self.flushed && self.received.is_some()
    }
}

/// Code to put on the wire for a locally requested close
///
/// Codes that may not be sent become 1000. A client never sends 1012/1013,
/// those are reserved for servers.
pub fn wire_close_code(role: Role, code: CloseCode) -> CloseCode {
    let raw = code.as_u16();
    if !CloseCode::is_valid_on_wire(raw) {
        return CloseCode::Normal;
    }
    match (role, code) {
        (Role::Client, CloseCode::ServiceRestart | CloseCode::TryAgainLater) => CloseCode::Normal,
        _ => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Open));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Open.can_transition_to(Closing));
        assert!(Open.can_transition_to(Closed));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Open));
        assert!(!Closing.can_transition_to(Open));
        assert!(!Open.can_transition_to(Connecting));
    }

    #[test]
    fn test_wire_close_code() {
        assert_eq!(wire_close_code(Role::Server, CloseCode::NoStatus), CloseCode::Normal);
        assert_eq!(wire_close_code(Role::Server, CloseCode::Abnormal), CloseCode::Normal);
        assert_eq!(wire_close_code(Role::Client, CloseCode::TlsHandshake), CloseCode::Normal);
        assert_eq!(wire_close_code(Role::Client, CloseCode::ServiceRestart), CloseCode::Normal);
        assert_eq!(wire_close_code(Role::Client, CloseCode::TryAgainLater), CloseCode::Normal);
        assert_eq!(
            wire_close_code(Role::Server, CloseCode::TryAgainLater),
            CloseCode::TryAgainLater
        );
        assert_eq!(wire_close_code(Role::Client, CloseCode::Other(4000)), CloseCode::Other(4000));
    }

    #[test]
    fn test_first_close_wins() {
        let mut close = CloseHandshake::default();
        close.record_received(CloseReason::new(4000u16, "peer"));
        close.record_sent(CloseReason::normal());
        assert_eq!(close.first.as_ref().map(|r| r.code), Some(CloseCode::Other(4000)));
        assert!(!close.is_complete());
        close.flushed = true;
        assert!(close.is_complete());
    }
}
