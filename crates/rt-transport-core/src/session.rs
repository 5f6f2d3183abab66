//! Per-peer session: sequence/ack bookkeeping, the outbound send buffer used
//! for replay on reconnect, and the connection-half state machine (spec.md
//! §3, §4.1, §4.2).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use rt_wire::{Codec, ControlFlags, PartialMessage, TransportMessage};

use crate::connection::Connection;
use crate::framing::encode_frame;
use crate::log::Log;
use crate::state_machine::SessionConnState;

/// Outcome of running an inbound non-ack message through the sequence check
/// (spec.md §4.3 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Accepted,
    Duplicate,
    OutOfOrder { expected: u64 },
}

/// One peer's session state. Survives across connection replacement
/// (reconnect); destroyed only when the grace period elapses or the
/// transport closes.
pub struct Session {
    pub id: String,
    pub from: String,
    pub to: String,
    /// The session id this peer has most recently claimed for itself,
    /// distinct from `id` (our own, locally generated, spec.md §3). Compared
    /// across reconnects to tell a transparent reconnect of the same peer
    /// identity apart from the peer having restarted with a fresh identity.
    pub advertised_session_id: Option<String>,
    pub seq: u64,
    pub ack: u64,
    pub send_buffer: VecDeque<TransportMessage>,
    pub state: SessionConnState,
    pub connection: Option<Arc<dyn Connection>>,
    pub handshake_metadata: Option<serde_json::Value>,
    pub heartbeat_miss_count: u32,
    pub next_heartbeat_due: Option<Instant>,
    pub grace_deadline: Option<Instant>,
}

impl Session {
    pub fn new(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Session {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            advertised_session_id: None,
            seq: 0,
            ack: 0,
            send_buffer: VecDeque::new(),
            state: SessionConnState::NoConnection,
            connection: None,
            handshake_metadata: None,
            heartbeat_miss_count: 0,
            next_heartbeat_due: None,
            grace_deadline: None,
        }
    }

    fn stamp(&mut self, partial: PartialMessage, id: String) -> TransportMessage {
        let msg = TransportMessage {
            id,
            from: self.from.clone(),
            to: partial.to,
            seq: self.seq,
            ack: self.ack,
            stream_id: partial.stream_id,
            service_name: partial.service_name,
            procedure_name: partial.procedure_name,
            control_flags: partial.control_flags,
            tracing: partial.tracing,
            payload: partial.payload,
        };
        self.seq += 1;
        msg
    }

    /// Stamp, buffer, and (if connected) transmit one outbound application or
    /// control message (spec.md §4.1 outbound algorithm). Buffering happens
    /// unconditionally so a message sent while disconnected is replayed once
    /// a connection is re-established. Write failures are swallowed here —
    /// the caller's job is only to decide whether to tear down the
    /// connection, which it does via `drop_connection`.
    pub async fn send(&mut self, partial: PartialMessage, id: String, codec: &dyn Codec, log: &dyn Log) -> String {
        let msg = self.stamp(partial, id);
        let msg_id = msg.id.clone();
        self.send_buffer.push_back(msg.clone());

        if let Some(conn) = self.connection.clone() {
            match codec.encode(&msg) {
                Ok(bytes) => {
                    if let Err(e) = conn.send(encode_frame(&bytes)).await {
                        log.warn(&format!("write to {} failed, buffering for replay: {e}", self.to));
                    }
                }
                Err(e) => log.error(&format!("failed to encode outbound message: {e}")),
            }
        }
        msg_id
    }

    /// Drop every buffered message the peer has already acknowledged
    /// (spec.md §4.1: "any inbound ack prunes the buffer up to that point").
    pub fn prune_send_buffer(&mut self, peer_ack: u64) {
        while matches!(self.send_buffer.front(), Some(m) if m.seq < peer_ack) {
            self.send_buffer.pop_front();
        }
    }

    /// Run one non-ack inbound message through the sequence check against
    /// `self.ack`, advancing it on acceptance. Ack-bearing messages
    /// (heartbeats, explicit acks) never reach here — they only prune the
    /// send buffer via `prune_send_buffer`, since their `seq` field is not
    /// part of the 0,1,2,... application sequence (spec.md §3 invariant;
    /// resolved ambiguity, see DESIGN.md).
    pub fn accept_inbound(&mut self, msg_seq: u64) -> InboundOutcome {
        if msg_seq == self.ack {
            self.ack += 1;
            InboundOutcome::Accepted
        } else if msg_seq < self.ack {
            InboundOutcome::Duplicate
        } else {
            InboundOutcome::OutOfOrder { expected: self.ack }
        }
    }

    /// Adopt a newly established connection. `transparent` reconnects
    /// (same session id negotiated) keep `seq`/`ack` and replay the buffer;
    /// a fresh session (different/absent session id) resets both to zero
    /// and starts the buffer over (spec.md §4.2 identity tie-break).
    pub async fn adopt_connection(
        &mut self,
        conn: Arc<dyn Connection>,
        transparent: bool,
        codec: &dyn Codec,
        log: &dyn Log,
        heartbeat_due: Instant,
    ) {
        if !transparent {
            self.seq = 0;
            self.ack = 0;
            self.send_buffer.clear();
        }
        // spec.md §4.2 tie-break: a new connection arriving while already
        // `Connected` replaces, rather than joins, the old one.
        if let Some(old) = self.connection.take() {
            if !Arc::ptr_eq(&old, &conn) {
                old.close().await;
            }
        }
        self.connection = Some(conn.clone());
        self.state = SessionConnState::Connected;
        self.heartbeat_miss_count = 0;
        self.next_heartbeat_due = Some(heartbeat_due);
        self.grace_deadline = None;

        let buffered: Vec<TransportMessage> = self.send_buffer.iter().cloned().collect();
        for msg in buffered {
            match codec.encode(&msg) {
                Ok(bytes) => {
                    if let Err(e) = conn.send(encode_frame(&bytes)).await {
                        log.warn(&format!("replay to {} failed: {e}", self.to));
                        break;
                    }
                }
                Err(e) => log.error(&format!("failed to encode replayed message: {e}")),
            }
        }
    }

    /// Tear down the connection half without destroying the session
    /// (spec.md §4.2 `Connected --ConnClosed--> NoConnection`). The caller
    /// is responsible for starting the disconnect grace period afterward.
    pub fn drop_connection(&mut self) {
        self.connection = None;
        self.state = SessionConnState::NoConnection;
        self.next_heartbeat_due = None;
    }

    pub fn begin_grace(&mut self, deadline: Instant) {
        self.grace_deadline = Some(deadline);
    }

    pub fn cancel_grace(&mut self) {
        self.grace_deadline = None;
    }

    /// Reset liveness bookkeeping on any inbound frame (spec.md §4.1: a
    /// heartbeat or any other message both count as "peer is alive").
    pub fn mark_alive(&mut self) {
        self.heartbeat_miss_count = 0;
        self.cancel_grace();
    }

    pub async fn build_heartbeat(&mut self, id: String) -> TransportMessage {
        let partial = PartialMessage {
            to: self.to.clone(),
            stream_id: "heartbeat".to_owned(),
            service_name: None,
            procedure_name: None,
            control_flags: ControlFlags::ACK,
            tracing: None,
            payload: rt_wire::Payload::Control(rt_wire::ControlPayload::Ack),
        };
        TransportMessage {
            id,
            from: self.from.clone(),
            to: partial.to,
            seq: self.seq,
            ack: self.ack,
            stream_id: partial.stream_id,
            service_name: None,
            procedure_name: None,
            control_flags: partial.control_flags,
            tracing: None,
            payload: partial.payload,
        }
    }
}
