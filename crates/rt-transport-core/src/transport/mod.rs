mod client;
mod core;
mod server;

pub use client::{Client, ClientError};
pub use core::{TickEvent, TransportCore, TransportMetrics};
pub use server::{Server, ServerError};

use std::sync::Arc;
use rt_wire::Codec;
use tokio::sync::Mutex as TokioMutex;

use crate::connection::Connection;
use crate::framing::FramedReader;
use crate::log::Log;

/// Post-handshake steady state for one connection: pull frames, decode, and
/// hand them to `TransportCore::process_inbound` until the carrier's channel
/// closes. Shared by `Client` (after a successful dial) and `Server` (after
/// accepting and handshaking an inbound connection) — spec.md §4.3 applies
/// identically to both once a connection is `Connected`.
async fn run_read_loop(
    core: Arc<TokioMutex<TransportCore>>,
    peer: String,
    connection: Arc<dyn Connection>,
    mut reader: FramedReader,
    log: Arc<dyn Log>,
) {
    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                log.error(&format!("framing error on connection to {peer}: {e}"));
                break;
            }
        };
        let decoded = {
            let core_guard = core.lock().await;
            core_guard.codec.decode(&frame)
        };
        match decoded {
            Ok(msg) => {
                let mut core_guard = core.lock().await;
                core_guard.process_inbound(&peer, msg).await;
            }
            Err(e) => log.warn(&format!("dropping unparseable frame from {peer}: {e}")),
        }
    }
    connection.close().await;
    let mut core_guard = core.lock().await;
    core_guard.handle_connection_closed(&peer, &connection).await;
}
