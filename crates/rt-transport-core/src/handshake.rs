//! Handshake protocol (spec.md §4.4): request/response control messages
//! exchanging protocol version, session id, and optional metadata.

use async_trait::async_trait;
use rt_wire::{ControlFlags, ControlPayload, HandshakeStatus, Payload, TransportMessage};

pub const HANDSHAKE_STREAM_ID: &str = "handshake";

pub fn build_handshake_request(
    from: &str,
    to: &str,
    protocol_version: &str,
    session_id: &str,
    metadata: Option<serde_json::Value>,
) -> TransportMessage {
    TransportMessage {
        id: uuid::Uuid::new_v4().to_string(),
        from: from.to_owned(),
        to: to.to_owned(),
        seq: 0,
        ack: 0,
        stream_id: HANDSHAKE_STREAM_ID.to_owned(),
        service_name: None,
        procedure_name: None,
        control_flags: ControlFlags::NONE,
        tracing: None,
        payload: Payload::Control(ControlPayload::HandshakeReq {
            protocol_version: protocol_version.to_owned(),
            session_id: session_id.to_owned(),
            metadata,
        }),
    }
}

pub fn build_handshake_response(from: &str, to: &str, status: HandshakeStatus) -> TransportMessage {
    TransportMessage {
        id: uuid::Uuid::new_v4().to_string(),
        from: from.to_owned(),
        to: to.to_owned(),
        seq: 0,
        ack: 0,
        stream_id: HANDSHAKE_STREAM_ID.to_owned(),
        service_name: None,
        procedure_name: None,
        control_flags: ControlFlags::NONE,
        tracing: None,
        payload: Payload::Control(ControlPayload::HandshakeResp { status }),
    }
}

/// Client-side hook: produce handshake metadata matching a schema the
/// server will validate. A `construct` that returns `Err` rejects the
/// connection attempt locally before any bytes are sent (spec.md §4.4
/// client step 1).
#[async_trait]
pub trait ConstructMeta: Send + Sync {
    async fn construct(&self) -> Result<serde_json::Value, String>;
}

/// Server-side hook: schema-check raw metadata and associate parsed
/// metadata with the session. Takes the previous parsed metadata for this
/// peer (if any) so e.g. a re-handshake can be validated against history.
/// Returning `Err` rejects with "malformed handshake metadata" or an
/// application-specific reason (spec.md §4.4 server steps 4-5).
#[async_trait]
pub trait ValidateMeta: Send + Sync {
    async fn validate(
        &self,
        raw: &serde_json::Value,
        previous: Option<&serde_json::Value>,
    ) -> Result<serde_json::Value, String>;
}
