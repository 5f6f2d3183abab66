use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use rt_transport_core::{Connection, Dialer, EstablishedConnection};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::{arc_connection, ClientSinkConnection};

#[derive(Debug, thiserror::Error)]
pub enum WsDialerError {
    #[error("no address registered for peer {0}")]
    UnknownPeer(String),
    #[error("websocket connect failed: {0}")]
    Connect(String),
}

impl From<WsDialerError> for io::Error {
    fn from(e: WsDialerError) -> Self {
        io::Error::other(e.to_string())
    }
}

/// Resolves a peer id to a `ws://`/`wss://` URL via a static address book
/// and dials it with `tokio-tungstenite`. One instance is shared by a
/// `rt_transport_core::Client` across every peer it talks to.
pub struct WsDialer {
    addresses: HashMap<String, String>,
}

impl WsDialer {
    pub fn new(addresses: HashMap<String, String>) -> Arc<Self> {
        Arc::new(WsDialer { addresses })
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, peer: &str) -> Result<EstablishedConnection, io::Error> {
        let url = self
            .addresses
            .get(peer)
            .ok_or_else(|| WsDialerError::UnknownPeer(peer.to_owned()))?;

        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| WsDialerError::Connect(e.to_string()))?;
        let (sink, mut source) = stream.split();

        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(TungsteniteMessage::Binary(data)) => {
                        if tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Ok(TungsteniteMessage::Close(_)) => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            // Dropping `tx` here signals close to `FramedReader::next_frame`.
        });

        let connection: ClientSinkConnection = crate::SinkConnection::new(sink);
        Ok(EstablishedConnection {
            connection: arc_connection(connection),
            inbound: rx,
        })
    }
}
