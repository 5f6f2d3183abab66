//! Session state machine, handshake protocol, and reliable in-order
//! delivery for the rt-transport runtime. This crate owns everything that
//! sits between a raw byte-carrying `Connection` and an application's
//! `send`/`message` API: framing, the handshake, sequence/ack bookkeeping
//! and replay-on-reconnect, heartbeats, retry budgeting with backoff, and
//! the event dispatcher consumers observe all of it through.
//!
//! Wire types and the `Codec` capability live in `rt-wire`; concrete byte
//! carriers (WebSocket, Unix socket, stdio) live in their own crates and
//! implement the `Connection`/`Dialer` traits defined here.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod framing;
pub mod handshake;
pub mod log;
pub mod retry;
pub mod session;
pub mod state_machine;
mod transport;

pub use config::TransportConfig;
pub use connection::{Connection, Dialer, EstablishedConnection};
pub use error::{ConnectionError, FramingError, ProtocolErrorKind, TransportClosedError};
pub use events::{ConnStatus, Event, EventDispatcher, EventKind, ListenerId, TransportStatus};
pub use handshake::{build_handshake_request, build_handshake_response, ConstructMeta, ValidateMeta};
pub use log::{Log, NullLog, TracingLog};
pub use retry::RetryBudget;
pub use session::Session;
pub use state_machine::{SessionConnState, Transition};
pub use transport::{Client, ClientError, Server, ServerError, TickEvent, TransportMetrics};
