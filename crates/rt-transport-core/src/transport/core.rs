//! Shared session registry and message-processing logic used by both
//! `Client` and `Server` (spec.md §4.3 inbound algorithm, §4.1 outbound
//! algorithm). Everything here assumes the caller holds the enclosing
//! `tokio::sync::Mutex`, i.e. this is the "single logical execution context"
//! spec.md §5 requires — it is never accessed from two call sites at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rt_wire::{Codec, ControlFlags, ControlPayload, Payload, PartialMessage, TransportMessage};

use crate::connection::Connection;
use crate::error::{ProtocolErrorKind, TransportClosedError};
use crate::events::{ConnStatus, Event, EventDispatcher};
use crate::framing::encode_frame;
use crate::log::Log;
use crate::session::{InboundOutcome, Session};
use crate::state_machine::SessionConnState;
use crate::config::TransportConfig;

/// What happened to a session's connection half during one `tick()` call,
/// so `Client` can decide whether to schedule a reconnect.
#[derive(Debug, Clone)]
pub enum TickEvent {
    /// Heartbeat deadman fired: connection dropped, session kept alive
    /// through its grace period, eligible for transparent reconnect.
    HeartbeatDead { peer: String },
    /// Grace period elapsed with no reconnect: session destroyed outright.
    GraceExpired { peer: String },
}

/// Observability counters (SPEC_FULL.md §4.3 supplemental), mirroring the
/// teacher's `StreamMetrics` (`raw_count`/`dedup_count`/`retransmit_count`)
/// invariant: every inbound frame is accounted for exactly once, as either
/// accepted, a duplicate, or a fatal ordering violation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Inbound non-ack messages accepted and dispatched upward.
    pub messages_delivered: u64,
    /// Inbound non-ack messages dropped because `seq < session.ack`.
    pub duplicates_dropped: u64,
    /// Sessions destroyed because `seq > session.ack` (spec.md §4.3 fatal case).
    pub out_of_order_fatal: u64,
}

pub struct TransportCore {
    pub local_peer: String,
    pub sessions: HashMap<String, Session>,
    pub config: TransportConfig,
    pub codec: Arc<dyn Codec>,
    pub events: Arc<EventDispatcher>,
    pub log: Arc<dyn Log>,
    pub closed: bool,
    pub metrics: TransportMetrics,
}

impl TransportCore {
    pub fn new(
        local_peer: String,
        config: TransportConfig,
        codec: Arc<dyn Codec>,
        events: Arc<EventDispatcher>,
        log: Arc<dyn Log>,
    ) -> Self {
        TransportCore {
            local_peer,
            sessions: HashMap::new(),
            config,
            codec,
            events,
            log,
            closed: false,
            metrics: TransportMetrics::default(),
        }
    }

    pub fn metrics(&self) -> TransportMetrics {
        self.metrics
    }

    /// Stamp and buffer an outbound message, transmitting immediately if a
    /// connection is live (spec.md §4.1). Lazily creates a session (and its
    /// locally-proposed session id) the first time a peer is addressed.
    pub async fn send(
        &mut self,
        to: &str,
        partial: PartialMessage,
        msg_id: String,
    ) -> Result<String, TransportClosedError> {
        if self.closed {
            return Err(TransportClosedError);
        }
        let local_peer = self.local_peer.clone();
        let session = self.sessions.entry(to.to_owned()).or_insert_with(|| {
            Session::new(uuid::Uuid::new_v4().to_string(), local_peer, to.to_owned())
        });
        Ok(session.send(partial, msg_id, self.codec.as_ref(), self.log.as_ref()).await)
    }

    /// Build and send a stream-control message: `STREAM_CLOSED`,
    /// `STREAM_CLOSE_REQUEST`, or `STREAM_ABORT`, all riding the same `CLOSE`
    /// control payload and ordinary seq/ack discipline (spec.md §6
    /// `send_close_stream`/`send_request_close`/`send_abort`; SPEC_FULL.md §9
    /// Open Question resolution — the transport does not interpret these
    /// bits, only carries them).
    pub async fn send_stream_control(
        &mut self,
        to: &str,
        stream_id: &str,
        flag: ControlFlags,
        msg_id: String,
    ) -> Result<String, TransportClosedError> {
        let partial = PartialMessage {
            to: to.to_owned(),
            stream_id: stream_id.to_owned(),
            service_name: None,
            procedure_name: None,
            control_flags: flag,
            tracing: None,
            payload: Payload::Control(ControlPayload::Close),
        };
        self.send(to, partial, msg_id).await
    }

    /// Process one decoded inbound frame from `peer` (spec.md §4.3).
    pub async fn process_inbound(&mut self, peer: &str, msg: TransportMessage) {
        if self.closed {
            return;
        }
        let Some(session) = self.sessions.get_mut(peer) else {
            self.log.warn(&format!("inbound message from unregistered peer {peer}"));
            return;
        };
        session.mark_alive();
        session.prune_send_buffer(msg.ack);

        if msg.control_flags.is_ack() {
            // Heartbeats and explicit acks are not part of the seq/ack
            // sequence (spec.md §3); pruning above is their entire effect.
            return;
        }

        match session.accept_inbound(msg.seq) {
            InboundOutcome::Accepted => {
                self.metrics.messages_delivered += 1;
                self.events.dispatch(Event::Message(msg));
            }
            InboundOutcome::Duplicate => {
                self.metrics.duplicates_dropped += 1;
                self.log
                    .debug(&format!("dropping duplicate seq={} from {peer}", msg.seq));
            }
            InboundOutcome::OutOfOrder { expected } => {
                let actual = msg.seq;
                self.metrics.out_of_order_fatal += 1;
                self.events.dispatch(Event::ProtocolError {
                    peer: Some(peer.to_owned()),
                    kind: ProtocolErrorKind::MessageOrderingViolated { expected, actual },
                });
                self.destroy_session(peer).await;
            }
        }
    }

    /// A carrier reported the underlying socket closed. `observed` is the
    /// specific `Connection` the caller's read loop was attached to — if the
    /// session has since moved on to a newer connection (a reconnect raced
    /// ahead of this notification), this is a no-op rather than tearing
    /// down the live connection. Drops the connection half and starts the
    /// disconnect grace period; the session itself survives so a reconnect
    /// can resume it transparently.
    pub async fn handle_connection_closed(&mut self, peer: &str, observed: &Arc<dyn Connection>) {
        if self.closed {
            return;
        }
        let grace = self.config.session_disconnect_grace;
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };
        match &session.connection {
            Some(current) if Arc::ptr_eq(current, observed) => {}
            _ => return,
        }
        session.drop_connection();
        session.begin_grace(Instant::now() + grace);
        self.events.dispatch(Event::ConnectionStatus {
            peer: peer.to_owned(),
            status: ConnStatus::Disconnect,
        });
        self.events.dispatch(Event::SessionTransition {
            peer: peer.to_owned(),
            state: SessionConnState::NoConnection,
        });
    }

    /// Work out, without mutating anything, what local session id this
    /// transport should use for `peer` and whether `peer_advertised_session_id`
    /// continues that peer's existing identity (spec.md §3: `id` is our own
    /// stable identifier, never the peer's; `advertisedSessionId` is what we
    /// last heard the peer call itself). A server needs this *before* it can
    /// build its handshake response (the response carries our own id), so
    /// this is exposed separately from `adopt_connection` rather than folded
    /// into it.
    pub fn resolve_session_identity(&self, peer: &str, peer_advertised_session_id: &str) -> (String, bool) {
        match self.sessions.get(peer) {
            Some(existing) if existing.advertised_session_id.as_deref() == Some(peer_advertised_session_id) => {
                (existing.id.clone(), true)
            }
            _ => (uuid::Uuid::new_v4().to_string(), false),
        }
    }

    /// Adopt a connection that just completed handshake (either as a client
    /// dial or a server accept). `local_session_id`/`transparent` come from
    /// `resolve_session_identity`, computed against the same session map
    /// before this call (the server needs them earlier to build its
    /// handshake response; the client can resolve them right here).
    /// `peer_advertised_session_id` is recorded so the *next* reconnect can
    /// tell a transparent resume from the peer having restarted with a fresh
    /// identity. A transparent reconnect never re-fires `sessionStatus`
    /// (spec.md §7: "sessionStatus unchanged"); only a genuine identity
    /// change disconnects the old session before the new one connects.
    pub async fn adopt_connection(
        &mut self,
        peer: &str,
        conn: Arc<dyn Connection>,
        local_session_id: String,
        peer_advertised_session_id: String,
        transparent: bool,
        metadata: Option<serde_json::Value>,
    ) {
        let local_peer = self.local_peer.clone();
        let had_prior_identity = self
            .sessions
            .get(peer)
            .map(|s| s.advertised_session_id.is_some())
            .unwrap_or(false);

        // spec.md §4.2 / §8 "fresh session on identity change": only a peer
        // that previously completed a handshake and is now advertising a
        // different id gets an observable disconnect. A session that never
        // got past dialing/handshaking (including the very first connect)
        // has nothing to disconnect from.
        if !transparent && had_prior_identity {
            if let Some(mut old) = self.sessions.remove(peer) {
                if let Some(old_conn) = old.connection.take() {
                    old_conn.close().await;
                }
                self.events.dispatch(Event::SessionStatus {
                    peer: peer.to_owned(),
                    session_id: old.id.clone(),
                    status: ConnStatus::Disconnect,
                });
                self.events.dispatch(Event::SessionTransition {
                    peer: peer.to_owned(),
                    state: SessionConnState::NoConnection,
                });
            }
        }

        let session = self
            .sessions
            .entry(peer.to_owned())
            .or_insert_with(|| Session::new(local_session_id, local_peer, peer.to_owned()));
        session.advertised_session_id = Some(peer_advertised_session_id);
        session.handshake_metadata = metadata;

        let due = Instant::now() + self.config.heartbeat_interval;
        session
            .adopt_connection(conn, transparent, self.codec.as_ref(), self.log.as_ref(), due)
            .await;

        let session_id = session.id.clone();
        self.events.dispatch(Event::ConnectionStatus {
            peer: peer.to_owned(),
            status: ConnStatus::Connect,
        });
        if !transparent {
            self.events.dispatch(Event::SessionStatus {
                peer: peer.to_owned(),
                session_id,
                status: ConnStatus::Connect,
            });
        }
        self.events.dispatch(Event::SessionTransition {
            peer: peer.to_owned(),
            state: SessionConnState::Connected,
        });
    }

    async fn destroy_session(&mut self, peer: &str) {
        if let Some(mut session) = self.sessions.remove(peer) {
            if let Some(conn) = session.connection.take() {
                conn.close().await;
            }
            self.events.dispatch(Event::SessionStatus {
                peer: peer.to_owned(),
                session_id: session.id.clone(),
                status: ConnStatus::Disconnect,
            });
            self.events.dispatch(Event::SessionTransition {
                peer: peer.to_owned(),
                state: SessionConnState::NoConnection,
            });
        }
    }

    /// One pass of the shared clock: fire due heartbeats, kill connections
    /// that missed too many, and destroy sessions whose grace period
    /// elapsed. Called periodically by a background task owned by `Client`
    /// / `Server` (spec.md §4.1 heartbeat + §4.2 grace timer).
    pub async fn tick(&mut self) -> Vec<TickEvent> {
        if self.closed {
            return Vec::new();
        }
        let now = Instant::now();
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        let mut events = Vec::new();

        for peer in peers {
            let grace_due = self
                .sessions
                .get(&peer)
                .and_then(|s| s.grace_deadline)
                .map(|d| now >= d)
                .unwrap_or(false);
            if grace_due {
                self.destroy_session(&peer).await;
                events.push(TickEvent::GraceExpired { peer });
                continue;
            }

            let heartbeat_due = self
                .sessions
                .get(&peer)
                .map(|s| s.state == SessionConnState::Connected && s.next_heartbeat_due.map(|d| now >= d).unwrap_or(false))
                .unwrap_or(false);
            if heartbeat_due {
                if let Some(event) = self.fire_heartbeat(&peer, now).await {
                    events.push(event);
                }
            }
        }
        events
    }

    async fn fire_heartbeat(&mut self, peer: &str, now: Instant) -> Option<TickEvent> {
        let interval = self.config.heartbeat_interval;
        let heartbeats_until_dead = self.config.heartbeats_until_dead;
        let grace = self.config.session_disconnect_grace;
        let codec = self.codec.clone();

        let session = self.sessions.get_mut(peer)?;
        let id = uuid::Uuid::new_v4().to_string();
        let hb = session.build_heartbeat(id).await;
        session.heartbeat_miss_count += 1;
        session.next_heartbeat_due = Some(now + interval);

        if let Some(conn) = session.connection.clone() {
            if let Ok(bytes) = codec.encode(&hb) {
                let _ = conn.send(encode_frame(&bytes)).await;
            }
        }

        if session.heartbeat_miss_count > heartbeats_until_dead {
            if let Some(conn) = session.connection.take() {
                conn.close().await;
            }
            session.drop_connection();
            session.begin_grace(now + grace);
            self.events.dispatch(Event::ConnectionStatus {
                peer: peer.to_owned(),
                status: ConnStatus::Disconnect,
            });
            self.events.dispatch(Event::SessionTransition {
                peer: peer.to_owned(),
                state: SessionConnState::NoConnection,
            });
            return Some(TickEvent::HeartbeatDead { peer: peer.to_owned() });
        }
        None
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer in peers {
            if let Some(mut session) = self.sessions.remove(&peer) {
                if let Some(conn) = session.connection.take() {
                    conn.close().await;
                }
            }
        }
        self.events
            .dispatch(Event::TransportStatus(crate::events::TransportStatus::Closed));
    }
}
