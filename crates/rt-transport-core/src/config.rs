//! Configuration (spec.md §6 "Configuration (enumerated)"). All keys default
//! to the values given in spec.md §4.5 / §4.7.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Period of the keepalive tick.
    pub heartbeat_interval: Duration,
    /// Kill the underlying connection after this many missed intervals.
    pub heartbeats_until_dead: u32,
    /// How long to keep a disconnected session alive awaiting reconnect.
    pub session_disconnect_grace: Duration,
    /// Per-connection deadline for completing handshake.
    pub handshake_timeout: Duration,
    /// Framer accumulation-buffer cap.
    pub max_buffer_size_bytes: usize,
    /// Max consecutive reconnect attempts before `RetriesExceeded`.
    pub attempt_budget_capacity: u32,
    /// Wall-clock interval per restored retry-budget token.
    pub budget_restore_interval: Duration,
    /// Base for exponential backoff.
    pub base_interval: Duration,
    /// Uniform jitter added to each backoff.
    pub max_jitter: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Whether a dropped post-handshake connection triggers automatic re-dial.
    pub reconnect_on_connection_drop: bool,
    /// Compared byte-exact during handshake; mismatch is fatal per-connection.
    pub protocol_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeats_until_dead: 3,
            session_disconnect_grace: Duration::from_millis(5_000),
            handshake_timeout: Duration::from_millis(5_000),
            max_buffer_size_bytes: 16 * 1024 * 1024,
            attempt_budget_capacity: 5,
            budget_restore_interval: Duration::from_millis(200),
            base_interval: Duration::from_millis(250),
            max_jitter: Duration::from_millis(200),
            max_backoff: Duration::from_millis(32_000),
            reconnect_on_connection_drop: true,
            protocol_version: "v1".to_owned(),
        }
    }
}
