//! The one reference `Connection`/`Dialer` carrier (spec.md §1 "out of
//! scope... supply a Connection capability"): WebSocket, client side over
//! `tokio-tungstenite`, server side over an `axum` upgrade. Framing, the
//! handshake, and all session bookkeeping live in `rt-transport-core`; this
//! crate only moves bytes.
//!
//! Grounded on `services/forwarder/src/uplink.rs` (client dial loop) and
//! `services/server/src/ws_forwarder.rs` (axum upgrade handler).

mod client;
mod server;

pub use client::{WsDialer, WsDialerError};
pub use server::accept_established;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use rt_transport_core::{Connection, ConnectionError};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

/// Shared plumbing: both the client and server sides end up with "something
/// that implements `futures_util::Sink<Message>`", just a different
/// concrete `Message` type (`tokio-tungstenite`'s vs `axum`'s). Each side's
/// module wraps its own sink half in one of these newtypes and implements
/// `Connection` by forwarding to it under a mutex — the trait requires
/// `&self`, but a WebSocket sink needs `&mut self` to write.
pub(crate) struct SinkConnection<S> {
    sink: TokioMutex<S>,
}

impl<S> SinkConnection<S> {
    pub(crate) fn new(sink: S) -> Self {
        SinkConnection { sink: TokioMutex::new(sink) }
    }
}

#[async_trait]
impl Connection for SinkConnection<SplitSink<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, TungsteniteMessage>> {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        self.sink
            .lock()
            .await
            .send(TungsteniteMessage::Binary(frame.into()))
            .await
            .map_err(|e| ConnectionError::Write(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

#[async_trait]
impl Connection for SinkConnection<SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>> {
    async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        self.sink
            .lock()
            .await
            .send(axum::extract::ws::Message::Binary(frame.into()))
            .await
            .map_err(|e| ConnectionError::Write(e.to_string()))
    }

    async fn close(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

pub(crate) type ClientSinkConnection = SinkConnection<
    SplitSink<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, TungsteniteMessage>,
>;
pub(crate) type ServerSinkConnection =
    SinkConnection<SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>>;

pub(crate) fn arc_connection<C: Connection + 'static>(conn: C) -> Arc<dyn Connection> {
    Arc::new(conn)
}
