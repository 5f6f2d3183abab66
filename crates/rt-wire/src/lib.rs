//! rt-wire: the on-wire envelope carried between two peers of the
//! rt-transport runtime, plus the `Codec` capability that turns an envelope
//! into bytes and back.
//!
//! Everything in this crate is data — no I/O, no session bookkeeping. The
//! session state machine in `rt-transport-core` is the only thing that
//! interprets these types.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Control flags
// ---------------------------------------------------------------------------

/// Bitfield carried on every envelope.
///
/// `STREAM_CLOSE_REQUEST` and `STREAM_ABORT` overlap in spirit with
/// `STREAM_CLOSED` (spec open question): by convention here,
/// `STREAM_CLOSE_REQUEST` means "peer wishes to stop reading" (a half-close)
/// and `STREAM_ABORT` means "peer is dropping the stream with an error
/// payload." The transport does not interpret either bit; it only carries
/// them through to the `message` event for the router layer to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlFlags(pub u8);

impl ControlFlags {
    pub const NONE: ControlFlags = ControlFlags(0);
    pub const ACK: ControlFlags = ControlFlags(0x1);
    pub const STREAM_OPEN: ControlFlags = ControlFlags(0x2);
    pub const STREAM_CLOSED: ControlFlags = ControlFlags(0x4);
    pub const STREAM_CLOSE_REQUEST: ControlFlags = ControlFlags(0x8);
    pub const STREAM_ABORT: ControlFlags = ControlFlags(0x10);

    pub fn contains(self, other: ControlFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: ControlFlags) -> ControlFlags {
        ControlFlags(self.0 | other.0)
    }

    pub fn is_ack(self) -> bool {
        self.contains(Self::ACK)
    }
}

impl std::ops::BitOr for ControlFlags {
    type Output = ControlFlags;
    fn bitor(self, rhs: ControlFlags) -> ControlFlags {
        self.with(rhs)
    }
}

impl std::ops::BitOrAssign for ControlFlags {
    fn bitor_assign(&mut self, rhs: ControlFlags) {
        self.0 |= rhs.0;
    }
}

// ---------------------------------------------------------------------------
// Tracing propagation
// ---------------------------------------------------------------------------

/// Distributed-tracing propagation fields, optional on every envelope.
/// The transport never reads these; it only threads them through so a
/// tracer, if wired above the transport, can stitch spans across peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracingContext {
    pub traceparent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

// ---------------------------------------------------------------------------
// Control payload
// ---------------------------------------------------------------------------

/// The control-plane payload carried by handshake, ack, and close messages.
/// Tagged on `type`, matching the wire contract of spec.md §3 and §4.4.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlPayload {
    Ack,
    Close,
    HandshakeReq {
        protocol_version: String,
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    HandshakeResp {
        #[serde(flatten)]
        status: HandshakeStatus,
    },
}

/// The `status` sub-object of a handshake response: either an accept
/// carrying the server's session id, or a reject carrying a human-readable
/// reason. Modeled as its own type (rather than inlined booleans) because
/// both client and server match on it exhaustively in `rt-transport-core`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakeStatus {
    Ok { ok: OkTrue, session_id: String },
    Rejected { ok: OkFalse, reason: String },
}

/// Unit-like marker types so `{"ok": true, ...}` / `{"ok": false, ...}`
/// round-trip through `#[serde(untagged)]` without a custom visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkTrue;
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OkFalse;

impl Serialize for OkTrue {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(true)
    }
}
impl<'de> Deserialize<'de> for OkTrue {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if bool::deserialize(d)? {
            Ok(OkTrue)
        } else {
            Err(serde::de::Error::custom("expected ok = true"))
        }
    }
}
impl Serialize for OkFalse {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bool(false)
    }
}
impl<'de> Deserialize<'de> for OkFalse {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if bool::deserialize(d)? {
            Err(serde::de::Error::custom("expected ok = false"))
        } else {
            Ok(OkFalse)
        }
    }
}

impl HandshakeStatus {
    pub fn accept(session_id: impl Into<String>) -> Self {
        HandshakeStatus::Ok {
            ok: OkTrue,
            session_id: session_id.into(),
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        HandshakeStatus::Rejected {
            ok: OkFalse,
            reason: reason.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, HandshakeStatus::Ok { .. })
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Either an opaque application payload (router-defined shape) or one of the
/// frozen control payloads. Kept as a real enum (rather than a raw
/// `serde_json::Value` the transport string-matches on `type`) so the
/// session/transport code can `match` instead of probing a JSON blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Control(ControlPayload),
    App(serde_json::Value),
}

impl Payload {
    pub fn as_control(&self) -> Option<&ControlPayload> {
        match self {
            Payload::Control(c) => Some(c),
            Payload::App(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The single on-wire record, after codec decode. See spec.md §3 for the
/// field-by-field contract; `seq`/`ack` discipline lives in
/// `rt-transport-core`, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub seq: u64,
    pub ack: u64,
    pub stream_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedure_name: Option<String>,
    #[serde(default)]
    pub control_flags: ControlFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing: Option<TracingContext>,
    pub payload: Payload,
}

impl TransportMessage {
    /// A partial outbound message as handed to `Transport::send` — the
    /// caller supplies everything except `id`/`from`/`seq`/`ack`, which the
    /// session stamps in on the way out (spec.md §4.1 outbound algorithm).
    pub fn is_ack_only(&self) -> bool {
        self.control_flags.is_ack()
    }
}

/// Fields a caller supplies to `Session::send`; the session fills in the
/// rest. Mirrors the teacher's pattern of a narrow "raw" input struct
/// (`RawConfig` et al. in `forwarder::config`) distinct from the fully
/// resolved type.
#[derive(Debug, Clone)]
pub struct PartialMessage {
    pub to: String,
    pub stream_id: String,
    pub service_name: Option<String>,
    pub procedure_name: Option<String>,
    pub control_flags: ControlFlags,
    pub tracing: Option<TracingContext>,
    pub payload: Payload,
}

impl PartialMessage {
    pub fn app(to: impl Into<String>, stream_id: impl Into<String>, payload: serde_json::Value) -> Self {
        PartialMessage {
            to: to.into(),
            stream_id: stream_id.into(),
            service_name: None,
            procedure_name: None,
            control_flags: ControlFlags::NONE,
            tracing: None,
            payload: Payload::App(payload),
        }
    }
}

// ---------------------------------------------------------------------------
// Codec capability
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Encode/decode a `TransportMessage` to/from bytes. JSON is the only
/// implementation shipped in-tree; others (msgpack, cbor) are
/// implementation-free per spec.md §1.
pub trait Codec: Send + Sync {
    fn encode(&self, msg: &TransportMessage) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<TransportMessage, CodecError>;
}

/// The reference JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &TransportMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<TransportMessage, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
