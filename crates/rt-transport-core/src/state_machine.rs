//! Session state machine (spec.md §4.2): the connection half of a session's
//! lifecycle, independent of the sequence/ack bookkeeping in `session.rs`.

/// The four states a session's connection half can be in. Only `Connected`
/// permits delivery of application messages upward (spec.md §3 Lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionConnState {
    NoConnection,
    Connecting,
    Handshaking,
    Connected,
}

/// The transition that just happened, for emitting `sessionTransition`
/// events and driving entry/exit actions (spec.md §4.2: "Each transition is
/// the only place that mutates the session's connection handle").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Dial,
    SocketOpen,
    Accept,
    HandshakeOk,
    ConnClosed,
    DialFail,
    Reject,
    HandshakeTimeout,
}

impl SessionConnState {
    /// Apply `transition`, returning the resulting state or `None` if the
    /// transition is not legal from the current state (spec.md §4.2
    /// diagram). Transitions are only ever driven internally by the
    /// transport, so an illegal transition reaching here is a bug, not a
    /// condition callers are expected to handle.
    pub fn apply(self, transition: Transition) -> Option<SessionConnState> {
        use SessionConnState::*;
        use Transition::*;
        match (self, transition) {
            (NoConnection, Dial) => Some(Connecting),
            (NoConnection, Accept) => Some(Handshaking),
            (Connecting, SocketOpen) => Some(Handshaking),
            (Connecting, DialFail) => Some(NoConnection),
            (Handshaking, HandshakeOk) => Some(Connected),
            (Handshaking, ConnClosed) | (Handshaking, Reject) | (Handshaking, HandshakeTimeout) => {
                Some(NoConnection)
            }
            (Connected, ConnClosed) => Some(NoConnection),
            _ => None,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, SessionConnState::Connected)
    }

    pub fn has_connection(self) -> bool {
        !matches!(self, SessionConnState::NoConnection)
    }
}
