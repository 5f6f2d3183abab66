//! Error taxonomy (spec.md §7). Most of these surface as `Event::ProtocolError`
//! rather than a `Result` a caller can `?`-propagate — they are async,
//! out-of-band notifications about a peer or a session, not the outcome of
//! the call that triggered them.

/// The three protocol-error classes from spec.md §7, each additionally
/// carrying whatever detail a listener needs to act on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolErrorKind {
    #[error("handshake failed: {reason}")]
    HandshakeFailed { reason: String },
    #[error("retry budget exhausted")]
    RetriesExceeded,
    #[error("message ordering violated: expected seq {expected}, got {actual}")]
    MessageOrderingViolated { expected: u64, actual: u64 },
}

/// Failure writing to a `Connection`. Local-scope: swallowed by the session
/// in favor of replay on the next reconnect (spec.md §4.1, §7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("write failed: {0}")]
    Write(String),
}

/// Returned synchronously by `send`/`connect` once a transport has been
/// closed (spec.md §7 propagation policy: "after close() every send throws
/// synchronously").
#[derive(Debug, Clone, thiserror::Error)]
#[error("transport is closed")]
pub struct TransportClosedError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FramingError {
    #[error("accumulation buffer exceeded {limit} bytes")]
    BufferOverflow { limit: usize },
}
