//! Client transport (spec.md §4.5): dials peers, drives the handshake,
//! retries with a leaky-bucket budget and exponential backoff, and owns the
//! background clock that fires heartbeats and reconnects on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use rt_wire::{Codec, JsonCodec, PartialMessage};

use crate::config::TransportConfig;
use crate::connection::Dialer;
use crate::error::{ProtocolErrorKind, TransportClosedError};
use crate::events::{Event, EventDispatcher, EventKind, ListenerId};
use crate::framing::FramedReader;
use crate::handshake::{build_handshake_request, ConstructMeta};
use crate::log::{Log, TracingLog};
use crate::retry::RetryBudget;
use crate::state_machine::{SessionConnState, Transition};

use super::core::{TickEvent, TransportCore};
use super::run_read_loop;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("transport is closed")]
    Closed,
    #[error("retry budget exhausted for peer")]
    RetriesExceeded,
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("dial failed: {0}")]
    Dial(String),
}

impl From<TransportClosedError> for ClientError {
    fn from(_: TransportClosedError) -> Self {
        ClientError::Closed
    }
}

/// Outcome of a single dial+handshake attempt, distinguishing failures
/// worth retrying from ones the caller should see immediately.
enum AttemptOutcome {
    Success,
    Retry,
    Terminal(ClientError),
}

pub struct Client {
    core: Arc<TokioMutexTransportCore>,
    dialer: Arc<dyn Dialer>,
    retry_budgets: tokio::sync::Mutex<HashMap<String, RetryBudget>>,
    dial_locks: StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    construct_meta: Option<Arc<dyn ConstructMeta>>,
    events: Arc<EventDispatcher>,
    local_peer: String,
    config: TransportConfig,
    codec: Arc<dyn Codec>,
    log: Arc<dyn Log>,
    clock: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

type TokioMutexTransportCore = tokio::sync::Mutex<TransportCore>;

impl Client {
    pub fn new(local_peer: impl Into<String>, dialer: Arc<dyn Dialer>, config: TransportConfig) -> Arc<Self> {
        Self::with_parts(local_peer, dialer, config, Arc::new(JsonCodec), Arc::new(TracingLog), None)
    }

    pub fn with_parts(
        local_peer: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        config: TransportConfig,
        codec: Arc<dyn Codec>,
        log: Arc<dyn Log>,
        construct_meta: Option<Arc<dyn ConstructMeta>>,
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

        let client = Arc::new(Client {
            core,
            dialer,
            retry_budgets: tokio::sync::Mutex::new(HashMap::new()),
            dial_locks: StdMutex::new(HashMap::new()),
            construct_meta,
            events,
            local_peer,
            config,
            codec,
            log,
            clock: StdMutex::new(None),
        });

        let handle = tokio::spawn(run_clock(client.clone()));
        *client.clock.lock().expect("clock mutex poisoned") = Some(handle);
        client
    }

    pub fn add_event_listener(&self, kind: EventKind, handler: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        self.events.add_listener(kind, handler)
    }

    pub fn remove_event_listener(&self, kind: EventKind, id: ListenerId) {
        self.events.remove_listener(kind, id)
    }

    /// Establish (or reuse) a connected session to `peer`. Coalesces
    /// concurrent calls for the same peer into a single dial attempt, and
    /// retries internally — subject to the peer's retry budget — until it
    /// succeeds, is rejected, or the budget is exhausted.
    pub async fn connect(self: &Arc<Self>, peer: &str) -> Result<(), ClientError> {
        loop {
            if self.is_already_connected(peer).await {
                return Ok(());
            }
            let dial_lock = self.peer_dial_lock(peer);
            let _guard = dial_lock.lock().await;
            if self.is_already_connected(peer).await {
                return Ok(());
            }
            {
                let core = self.core.lock().await;
                if core.closed {
                    return Err(ClientError::Closed);
                }
            }
            match self.attempt_once(peer).await {
                AttemptOutcome::Success => return Ok(()),
                AttemptOutcome::Terminal(e) => return Err(e),
                AttemptOutcome::Retry => continue,
            }
        }
    }

    async fn is_already_connected(&self, peer: &str) -> bool {
        let core = self.core.lock().await;
        core.sessions.get(peer).map(|s| s.state.is_connected()).unwrap_or(false)
    }

    fn peer_dial_lock(&self, peer: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.dial_locks.lock().expect("dial lock map poisoned");
        locks.entry(peer.to_owned()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    async fn attempt_once(self: &Arc<Self>, peer: &str) -> AttemptOutcome {
        let backoff = {
            let mut budgets = self.retry_budgets.lock().await;
            let budget = budgets
                .entry(peer.to_owned())
                .or_insert_with(|| RetryBudget::new(&self.config));
            if !budget.has_budget() {
                self.events.dispatch(Event::ProtocolError {
                    peer: Some(peer.to_owned()),
                    kind: ProtocolErrorKind::RetriesExceeded,
                });
                return AttemptOutcome::Terminal(ClientError::RetriesExceeded);
            }
            let delay = if budget.attempts() > 0 { Some(budget.backoff_delay()) } else { None };
            budget.consume();
            delay
        };
        if let Some(delay) = backoff {
            tokio::time::sleep(delay).await;
        }

        self.set_session_state(peer, Transition::Dial, SessionConnState::Connecting).await;

        let metadata = match &self.construct_meta {
            Some(c) => match c.construct().await {
                Ok(v) => Some(v),
                Err(reason) => {
                    self.set_session_state(peer, Transition::DialFail, SessionConnState::NoConnection).await;
                    return AttemptOutcome::Terminal(ClientError::HandshakeRejected(reason));
                }
            },
            None => None,
        };

        let established = match self.dialer.dial(peer).await {
            Ok(e) => e,
            Err(e) => {
                self.set_session_state(peer, Transition::DialFail, SessionConnState::NoConnection).await;
                self.log.warn(&format!("dial to {peer} failed: {e}"));
                return AttemptOutcome::Retry;
            }
        };

        self.set_session_state(peer, Transition::SocketOpen, SessionConnState::Handshaking).await;

        let session_id = {
            let core = self.core.lock().await;
            core.sessions
                .get(peer)
                .map(|s| s.id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
        };
        let request = build_handshake_request(&self.local_peer, peer, &self.config.protocol_version, &session_id, metadata);
        let Ok(bytes) = self.codec.encode(&request) else {
            established.connection.close().await;
            return AttemptOutcome::Terminal(ClientError::Dial("failed to encode handshake request".into()));
        };
        if established.connection.send(crate::framing::encode_frame(&bytes)).await.is_err() {
            established.connection.close().await;
            self.set_session_state(peer, Transition::ConnClosed, SessionConnState::NoConnection).await;
            return AttemptOutcome::Retry;
        }

        let mut reader = FramedReader::new(established.inbound, self.config.max_buffer_size_bytes);
        let response = tokio::time::timeout(self.config.handshake_timeout, reader.next_frame()).await;
        let frame = match response {
            Err(_elapsed) => {
                self.events.dispatch(Event::ProtocolError {
                    peer: Some(peer.to_owned()),
                    kind: ProtocolErrorKind::HandshakeFailed { reason: "handshake timed out".into() },
                });
                established.connection.close().await;
                self.set_session_state(peer, Transition::HandshakeTimeout, SessionConnState::NoConnection).await;
                return AttemptOutcome::Retry;
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                self.set_session_state(peer, Transition::ConnClosed, SessionConnState::NoConnection).await;
                return AttemptOutcome::Retry;
            }
            Ok(Err(e)) => {
                self.log.warn(&format!("framing error during handshake with {peer}: {e}"));
                established.connection.close().await;
                self.set_session_state(peer, Transition::ConnClosed, SessionConnState::NoConnection).await;
                return AttemptOutcome::Retry;
            }
        };

        let decoded = { self.codec.decode(&frame) };
        let response_msg = match decoded {
            Ok(m) => m,
            Err(e) => {
                self.log.warn(&format!("malformed handshake response from {peer}: {e}"));
                established.connection.close().await;
                self.set_session_state(peer, Transition::ConnClosed, SessionConnState::NoConnection).await;
                return AttemptOutcome::Retry;
            }
        };

        let status = match response_msg.payload.as_control() {
            Some(rt_wire::ControlPayload::HandshakeResp { status }) => status.clone(),
            _ => {
                self.log.warn(&format!("expected handshake response from {peer}, got something else"));
                established.connection.close().await;
                self.set_session_state(peer, Transition::ConnClosed, SessionConnState::NoConnection).await;
                return AttemptOutcome::Retry;
            }
        };

        match status {
            rt_wire::HandshakeStatus::Rejected { reason, .. } => {
                self.events.dispatch(Event::ProtocolError {
                    peer: Some(peer.to_owned()),
                    kind: ProtocolErrorKind::HandshakeFailed { reason: reason.clone() },
                });
                established.connection.close().await;
                self.set_session_state(peer, Transition::Reject, SessionConnState::NoConnection).await;
                AttemptOutcome::Terminal(ClientError::HandshakeRejected(reason))
            }
            rt_wire::HandshakeStatus::Ok { session_id: negotiated, .. } => {
                {
                    let mut budgets = self.retry_budgets.lock().await;
                    if let Some(b) = budgets.get_mut(peer) {
                        b.on_success();
                    }
                }
                let mut core = self.core.lock().await;
                let (local_session_id, transparent) = core.resolve_session_identity(peer, &negotiated);
                core.adopt_connection(peer, established.connection.clone(), local_session_id, negotiated, transparent, None)
                    .await;
                drop(core);

                let client = self.clone();
                let peer_owned = peer.to_owned();
                let core = self.core.clone();
                let connection = established.connection;
                let log = self.log.clone();
                tokio::spawn(async move {
                    run_read_loop(core, peer_owned.clone(), connection, reader, log).await;
                    client.reconnect_after_drop(&peer_owned).await;
                });
                AttemptOutcome::Success
            }
        }
    }

    /// Called once a connection's read loop ends, whichever side noticed
    /// first (heartbeat death or a clean EOF from the carrier). Redials
    /// only if the transport is still open and the caller opted into it
    /// (spec.md §4.4: `reconnectOnConnectionDrop`).
    async fn reconnect_after_drop(self: &Arc<Self>, peer: &str) {
        if !self.config.reconnect_on_connection_drop {
            return;
        }
        if self.core.lock().await.closed {
            return;
        }
        let _ = self.connect(peer).await;
    }

    async fn set_session_state(&self, peer: &str, transition: Transition, fallback: SessionConnState) {
        let local_peer = self.local_peer.clone();
        let mut core = self.core.lock().await;
        let session = core
            .sessions
            .entry(peer.to_owned())
            .or_insert_with(|| crate::session::Session::new(uuid::Uuid::new_v4().to_string(), local_peer, peer.to_owned()));
        session.state = session.state.apply(transition).unwrap_or(fallback);
        let state = session.state;
        core.events.dispatch(Event::SessionTransition { peer: peer.to_owned(), state });
    }

    /// Send an application message to `peer`, creating its session lazily if
    /// none exists yet (spec.md §4.5). Fire-and-forget: per spec.md §6/§4.1
    /// this only fails once the transport itself is closed, so it never
    /// awaits a dial — buffering is unconditional, and a connection attempt
    /// is kicked off in the background if one isn't already under way.
    pub async fn send(self: &Arc<Self>, to: &str, partial: PartialMessage) -> Result<String, ClientError> {
        if !self.is_already_connected(to).await {
            self.ensure_connecting(to);
        }
        let id = uuid::Uuid::new_v4().to_string();
        let mut core = self.core.lock().await;
        Ok(core.send(to, partial, id).await?)
    }

    /// Kick off `connect(to)` in the background. Errors (rejection, retries
    /// exhausted) are only ever observed via `Event::ProtocolError` — the
    /// caller that triggered this must not have them propagated to it.
    fn ensure_connecting(self: &Arc<Self>, to: &str) {
        let client = self.clone();
        let peer = to.to_owned();
        tokio::spawn(async move {
            let _ = client.connect(&peer).await;
        });
    }

    /// Convenience wrapper (spec.md §6) for `{controlFlags |= STREAM_CLOSED}`.
    pub async fn send_close_stream(self: &Arc<Self>, to: &str, stream_id: &str) -> Result<String, ClientError> {
        self.send_stream_control(to, stream_id, rt_wire::ControlFlags::STREAM_CLOSED).await
    }

    /// Convenience wrapper (spec.md §6) for the half-close bit: "peer wishes
    /// to stop reading" (SPEC_FULL.md §9).
    pub async fn send_request_close(self: &Arc<Self>, to: &str, stream_id: &str) -> Result<String, ClientError> {
        self.send_stream_control(to, stream_id, rt_wire::ControlFlags::STREAM_CLOSE_REQUEST).await
    }

    /// Convenience wrapper (spec.md §6) for "peer is dropping the stream
    /// with an error" (SPEC_FULL.md §9).
    pub async fn send_abort(self: &Arc<Self>, to: &str, stream_id: &str) -> Result<String, ClientError> {
        self.send_stream_control(to, stream_id, rt_wire::ControlFlags::STREAM_ABORT).await
    }

    async fn send_stream_control(self: &Arc<Self>, to: &str, stream_id: &str, flag: rt_wire::ControlFlags) -> Result<String, ClientError> {
        if !self.is_already_connected(to).await {
            self.ensure_connecting(to);
        }
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

async fn run_clock(client: Arc<Client>) {
    let tick_interval = client.clock_tick_interval();
    let mut interval = tokio::time::interval(tick_interval);
    loop {
        interval.tick().await;
        let events = {
            let mut core = client.core.lock().await;
            if core.closed {
                return;
            }
            core.tick().await
        };
        for event in events {
            if let TickEvent::HeartbeatDead { peer } = event {
                let client = client.clone();
                tokio::spawn(async move {
                    client.reconnect_after_drop(&peer).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, EstablishedConnection};
    use crate::events::EventKind;
    use crate::log::NullLog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct LoopbackConnection {
        to_peer: mpsc::Sender<Vec<u8>>,
    }

    #[async_trait]
    impl Connection for LoopbackConnection {
        async fn send(&self, frame: Vec<u8>) -> Result<(), crate::error::ConnectionError> {
            self.to_peer.send(frame).await.map_err(|_| crate::error::ConnectionError::Closed)
        }
        async fn close(&self) {}
    }

    /// A dialer that immediately accepts and replies with a canned
    /// handshake accept, for exercising `Client::connect` without a real
    /// carrier.
    struct AcceptingDialer {
        server_session_id: String,
        protocol_version: String,
    }

    #[async_trait]
    impl Dialer for AcceptingDialer {
        async fn dial(&self, _peer: &str) -> Result<EstablishedConnection, std::io::Error> {
            let (client_tx, mut client_rx) = mpsc::channel::<Vec<u8>>(8);
            let (server_tx, server_rx) = mpsc::channel::<Vec<u8>>(8);
            let server_session_id = self.server_session_id.clone();
            let protocol_version = self.protocol_version.clone();

            tokio::spawn(async move {
                let mut acc = crate::framing::FrameAccumulator::new(1024 * 1024);
                if let Some(chunk) = client_rx.recv().await {
                    let frames = acc.push(&chunk).unwrap_or_default();
                    if let Some(frame) = frames.into_iter().next() {
                        let codec = JsonCodec;
                        if let Ok(req) = codec.decode(&frame) {
                            let status = if req
                                .payload
                                .as_control()
                                .map(|c| matches!(c, rt_wire::ControlPayload::HandshakeReq { protocol_version: v, .. } if *v == protocol_version))
                                .unwrap_or(false)
                            {
                                rt_wire::HandshakeStatus::accept(server_session_id.clone())
                            } else {
                                rt_wire::HandshakeStatus::reject("protocol version mismatch")
                            };
                            let resp = crate::handshake::build_handshake_response("server", "client", status);
                            if let Ok(bytes) = codec.encode(&resp) {
                                let _ = server_tx.send(crate::framing::encode_frame(&bytes)).await;
                            }
                        }
                    }
                }
            });

            Ok(EstablishedConnection {
                connection: Arc::new(LoopbackConnection { to_peer: client_tx }),
                inbound: server_rx,
            })
        }
    }

    #[tokio::test]
    async fn connect_succeeds_against_an_accepting_peer() {
        let dialer = Arc::new(AcceptingDialer {
            server_session_id: "sess-server-1".into(),
            protocol_version: "v1".into(),
        });
        let client = Client::with_parts(
            "client-a",
            dialer,
            TransportConfig::default(),
            Arc::new(JsonCodec),
            Arc::new(NullLog),
            None,
        );

        let connected = Arc::new(AtomicUsize::new(0));
        let connected2 = connected.clone();
        client.add_event_listener(EventKind::ConnectionStatus, move |_| {
            connected2.fetch_add(1, Ordering::SeqCst);
        });

        client.connect("server").await.unwrap();
        assert_eq!(connected.load(Ordering::SeqCst), 1);
        client.close().await;
    }

    /// A dialer whose handshake-completing task drops its own sender once
    /// the reply is away, leaving the test holding the only other clone in
    /// `inbound_tx_slot`. Dropping that clone simulates a carrier noticing
    /// its socket closed (EOF on the read side) without any heartbeat
    /// involved — exercises `reconnect_on_connection_drop` directly.
    struct DroppableDialer {
        dial_count: Arc<AtomicUsize>,
        server_session_id: String,
        inbound_tx_slot: Arc<StdMutex<Option<mpsc::Sender<Vec<u8>>>>>,
    }

    #[async_trait]
    impl Dialer for DroppableDialer {
        async fn dial(&self, _peer: &str) -> Result<EstablishedConnection, std::io::Error> {
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            let (client_tx, mut client_rx) = mpsc::channel::<Vec<u8>>(8);
            let (server_tx, server_rx) = mpsc::channel::<Vec<u8>>(8);
            *self.inbound_tx_slot.lock().expect("slot mutex poisoned") = Some(server_tx.clone());
            let server_session_id = self.server_session_id.clone();

            tokio::spawn(async move {
                if let Some(chunk) = client_rx.recv().await {
                    let mut acc = crate::framing::FrameAccumulator::new(1024 * 1024);
                    if let Some(frame) = acc.push(&chunk).unwrap_or_default().into_iter().next() {
                        if JsonCodec.decode(&frame).is_ok() {
                            let resp = crate::handshake::build_handshake_response(
                                "server",
                                "client",
                                rt_wire::HandshakeStatus::accept(server_session_id),
                            );
                            if let Ok(bytes) = JsonCodec.encode(&resp) {
                                let _ = server_tx.send(crate::framing::encode_frame(&bytes)).await;
                            }
                        }
                    }
                }
            });

            Ok(EstablishedConnection {
                connection: Arc::new(LoopbackConnection { to_peer: client_tx }),
                inbound: server_rx,
            })
        }
    }

    #[tokio::test]
    async fn reconnect_on_connection_drop_redials_after_a_clean_eof() {
        let dial_count = Arc::new(AtomicUsize::new(0));
        let inbound_tx_slot = Arc::new(StdMutex::new(None));
        let dialer = Arc::new(DroppableDialer {
            dial_count: dial_count.clone(),
            server_session_id: "sess-1".into(),
            inbound_tx_slot: inbound_tx_slot.clone(),
        });
        let client = Client::with_parts("client-a", dialer, TransportConfig::default(), Arc::new(JsonCodec), Arc::new(NullLog), None);

        client.connect("server").await.unwrap();
        assert_eq!(dial_count.load(Ordering::SeqCst), 1);

        inbound_tx_slot.lock().expect("slot mutex poisoned").take();

        for _ in 0..50 {
            if dial_count.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(dial_count.load(Ordering::SeqCst), 2, "a clean EOF should trigger exactly one automatic redial");
        client.close().await;
    }

    #[tokio::test]
    async fn reconnect_on_connection_drop_disabled_leaves_the_session_dead() {
        let dial_count = Arc::new(AtomicUsize::new(0));
        let inbound_tx_slot = Arc::new(StdMutex::new(None));
        let dialer = Arc::new(DroppableDialer {
            dial_count: dial_count.clone(),
            server_session_id: "sess-1".into(),
            inbound_tx_slot: inbound_tx_slot.clone(),
        });
        let config = TransportConfig { reconnect_on_connection_drop: false, ..TransportConfig::default() };
        let client = Client::with_parts("client-a", dialer, config, Arc::new(JsonCodec), Arc::new(NullLog), None);

        client.connect("server").await.unwrap();
        assert_eq!(dial_count.load(Ordering::SeqCst), 1);

        inbound_tx_slot.lock().expect("slot mutex poisoned").take();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(dial_count.load(Ordering::SeqCst), 1, "no redial should happen once reconnectOnConnectionDrop is off");
        client.close().await;
    }

    #[tokio::test]
    async fn connect_is_rejected_on_protocol_version_mismatch() {
        let dialer = Arc::new(AcceptingDialer {
            server_session_id: "sess-server-1".into(),
            protocol_version: "v2".into(),
        });
        let client = Client::with_parts(
            "client-a",
            dialer,
            TransportConfig::default(),
            Arc::new(JsonCodec),
            Arc::new(NullLog),
            None,
        );

        let err = client.connect("server").await.unwrap_err();
        assert!(matches!(err, ClientError::HandshakeRejected(_)));
        client.close().await;
    }
}
