use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures_util::StreamExt;
use rt_transport_core::EstablishedConnection;
use tokio::sync::mpsc;

use crate::{arc_connection, ServerSinkConnection};

/// Split a just-upgraded `axum` WebSocket into the `Connection`/inbound-channel
/// pair `rt_transport_core::Server::handle_connection` expects. Call this
/// inside the `on_upgrade` closure of the route handler, then hand the
/// result straight to `Server::handle_connection` — that call performs the
/// handshake and, on success, spawns the read loop that drains `inbound`.
pub fn accept_established(socket: WebSocket) -> EstablishedConnection {
    let (sink, mut source) = socket.split();

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(AxumMessage::Binary(data)) => {
                    if tx.send(data.to_vec()).await.is_err() {
                        break;
                    }
                }
                Ok(AxumMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });

    let connection: ServerSinkConnection = crate::SinkConnection::new(sink);
    EstablishedConnection {
        connection: arc_connection(connection),
        inbound: rx,
    }
}
