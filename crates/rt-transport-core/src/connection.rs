//! Connection capability (spec.md §2 component 1): an abstract byte
//! carrier. Owns no protocol logic — just send a frame, close, and report
//! an error. The concrete carriers (WebSocket, Unix socket, stdio) live
//! outside this crate; this module defines only the trait they implement.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::ConnectionError;

/// Send raw, already-framed bytes and close. Implementations wrap a real
/// socket; the framer/codec sit above this trait, not inside it.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError>;
    async fn close(&self);
}

/// What a carrier hands the transport after a dial succeeds or a connection
/// is accepted: the send/close half as a `Connection`, and the receive half
/// as a channel of raw byte chunks (already off the wire, pre-framing). The
/// channel closing (sender dropped) signals the connection closed.
pub struct EstablishedConnection {
    pub connection: Arc<dyn Connection>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

/// The client-side dial capability: given a peer id, resolve it to an
/// address (carrier-specific) and establish a connection. Implemented by
/// `rt-ws-carrier` for WebSocket; any other carrier plugs in the same way.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, peer: &str) -> Result<EstablishedConnection, std::io::Error>;
}
