//! Server transport (spec.md §4.6): accepts already-open connections from a
//! carrier, drives the responder side of the handshake, and runs the same
//! heartbeat/grace clock as `Client` (without the reconnect trigger — the
//! server never dials out).

use std::sync::Arc;
use std::time::Duration;

use rt_wire::{Codec, JsonCodec, PartialMessage};

use crate::config::TransportConfig;
use crate::connection::EstablishedConnection;
use crate::error::TransportClosedError;
use crate::events::{Event, EventDispatcher, EventKind, ListenerId};
use crate::framing::{encode_frame, FramedReader};
use crate::handshake::{build_handshake_response, ValidateMeta};
use crate::log::{Log, TracingLog};

use super::core::TransportCore;
use super::run_read_loop;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerError {
    #[error("transport is closed")]
    Closed,
    #[error("peer {0} has no session")]
    UnknownPeer(String),
}

impl From<TransportClosedError> for ServerError {
    fn from(_: TransportClosedError) -> Self {
        ServerError::Closed
    }
}

pub struct Server {
    core: Arc<tokio::sync::Mutex<TransportCore>>,
    validate_meta: Option<Arc<dyn ValidateMeta>>,
    events: Arc<EventDispatcher>,
    local_peer: String,
    config: TransportConfig,
    codec: Arc<dyn Codec>,
    log: Arc<dyn Log>,
    clock: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Server {
    pub fn new(local_peer: impl Into<String>, config: TransportConfig) -> Arc<Self> {
        Self::with_parts(local_peer, config, Arc::new(JsonCodec), Arc::new(TracingLog), None)
    }

    pub fn with_parts(
        local_peer: impl Into<String>,
        config: TransportConfig,
        codec: Arc<dyn Codec>,
        log: Arc<dyn Log>,
        validate_meta: Option<Arc<dyn ValidateMeta>>,
    ) -> Arc<Self> {
        let local_peer = local_peer.into();
        let events = Arc::new(EventDispatcher::new());
        let core = Arc::new(tokio::sync::Mutex::new(TransportCore::new(
            local_peer.clone(),
            config.clone(),
            codec.clone(),
            events.clone(),
            log.clone(),
        )));

        let server = Arc::new(Server {
            core,
            validate_meta,
            events,
            local_peer,
            config,
            codec,
            log,
            clock: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(run_clock(server.clone()));
        *server.clock.lock().expect("clock mutex poisoned") = Some(handle);
        server
    }

    pub fn add_event_listener(&self, kind: EventKind, handler: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        self.events.add_listener(kind, handler)
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) {
        self.events.remove_listener(kind, id)
    }

    /// Accept a freshly-opened connection handed up by a carrier (e.g. an
    /// `axum` WebSocket upgrade). Reads the handshake request under
    /// `handshake_timeout`, validates protocol version and metadata, and —
    /// on success — adopts the connection and spawns its read loop.
    pub async fn handle_connection(self: &Arc<Self>, established: EstablishedConnection) {
        let mut reader = FramedReader::new(established.inbound, self.config.max_buffer_size_bytes);

        let first = tokio::time::timeout(self.config.handshake_timeout, reader.next_frame()).await;
        let frame = match first {
            Ok(Ok(Some(frame))) => frame,
            _ => {
                established.connection.close().await;
                return;
            }
        };

        let Ok(req) = self.codec.decode(&frame) else {
            established.connection.close().await;
            return;
        };
        let peer = req.from.clone();

        let Some(rt_wire::ControlPayload::HandshakeReq { protocol_version, session_id: proposed_id, metadata }) =
            req.payload.as_control().cloned()
        else {
            established.connection.close().await;
            return;
        };

        if protocol_version != self.config.protocol_version {
            let reason = format!(
                "protocol version mismatch: expected {}, got {protocol_version}",
                self.config.protocol_version
            );
            self.send_reject(&established, &peer, &reason).await;
            established.connection.close().await;
            return;
        }

        let previous_metadata = {
            let core = self.core.lock().await;
            core.sessions.get(&peer).and_then(|s| s.handshake_metadata.clone())
        };
        let validated_metadata = match &self.validate_meta {
            Some(v) => match v.validate(metadata.as_ref().unwrap_or(&serde_json::Value::Null), previous_metadata.as_ref()).await {
                Ok(parsed) => Some(parsed),
                Err(reason) => {
                    self.send_reject(&established, &peer, &reason).await;
                    established.connection.close().await;
                    return;
                }
            },
            None => metadata,
        };

        let (local_session_id, transparent) = {
            let core = self.core.lock().await;
            core.resolve_session_identity(&peer, &proposed_id)
        };

        let accept = build_handshake_response(&self.local_peer, &peer, rt_wire::HandshakeStatus::accept(local_session_id.clone()));
        let Ok(bytes) = self.codec.encode(&accept) else {
            established.connection.close().await;
            return;
        };
        if established.connection.send(encode_frame(&bytes)).await.is_err() {
            established.connection.close().await;
            return;
        }

        {
            let mut core = self.core.lock().await;
            core.adopt_connection(
                &peer,
                established.connection.clone(),
                local_session_id,
                proposed_id,
                transparent,
                validated_metadata,
            )
            .await;
        }

        tokio::spawn(run_read_loop(
            self.core.clone(),
            peer,
            established.connection,
            reader,
            self.log.clone(),
        ));
    }

    async fn send_reject(&self, established: &EstablishedConnection, peer: &str, reason: &str) {
        let resp = build_handshake_response(&self.local_peer, peer, rt_wire::HandshakeStatus::reject(reason));
        if let Ok(bytes) = self.codec.encode(&resp) {
            let _ = established.connection.send(encode_frame(&bytes)).await;
        }
        self.events.dispatch(Event::ProtocolError {
            peer: Some(peer.to_owned()),
            kind: crate::error::ProtocolErrorKind::HandshakeFailed { reason: reason.to_owned() },
        });
    }

    pub async fn send(&self, to: &str, partial: PartialMessage) -> Result<String, ServerError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut core = self.core.lock().await;
        Ok(core.send(to, partial, id).await?)
    }

    /// Convenience wrapper (spec.md §6) for `{controlFlags |= STREAM_CLOSED}`.
    pub async fn send_close_stream(&self, to: &str, stream_id: &str) -> Result<String, ServerError> {
        self.send_stream_control(to, stream_id, rt_wire::ControlFlags::STREAM_CLOSED).await
    }

    /// Convenience wrapper (spec.md §6) for the half-close bit: "peer wishes
    /// to stop reading" (SPEC_FULL.md §9).
    pub async fn send_request_close(&self, to: &str, stream_id: &str) -> Result<String, ServerError> {
        self.send_stream_control(to, stream_id, rt_wire::ControlFlags::STREAM_CLOSE_REQUEST).await
    }

    /// Convenience wrapper (spec.md §6) for "peer is dropping the stream
    /// with an error" (SPEC_FULL.md §9).
    pub async fn send_abort(&self, to: &str, stream_id: &str) -> Result<String, ServerError> {
        self.send_stream_control(to, stream_id, rt_wire::ControlFlags::STREAM_ABORT).await
    }

    async fn send_stream_control(&self, to: &str, stream_id: &str, flag: rt_wire::ControlFlags) -> Result<String, ServerError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut core = self.core.lock().await;
        Ok(core.send_stream_control(to, stream_id, flag, id).await?)
    }

    /// Duplicate-suppression and delivery counters (SPEC_FULL.md §4.3).
    pub async fn metrics(&self) -> super::core::TransportMetrics {
        self.core.lock().await.metrics()
    }

    pub async fn close(&self) {
        if let Some(handle) = self.clock.lock().expect("clock mutex poisoned").take() {
            handle.abort();
        }
        let mut core = self.core.lock().await;
        core.close().await;
    }

    fn clock_tick_interval(&self) -> Duration {
        let candidates = [
            self.config.heartbeat_interval,
            self.config.session_disconnect_grace,
            self.config.handshake_timeout,
        ];
        let min = candidates.into_iter().min().unwrap_or(Duration::from_millis(1000));
        (min / 10).max(Duration::from_millis(20))
    }
}

async fn run_clock(server: Arc<Server>) {
    let tick_interval = server.clock_tick_interval();
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        interval.tick().await;
        let mut core = server.core.lock().await;
        if core.closed {
            return;
        }
        let _ = core.tick().await;
    }
}
