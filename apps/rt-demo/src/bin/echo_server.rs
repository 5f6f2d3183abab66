//! Minimal echo server: accepts WebSocket connections, runs the
//! rt-transport-core handshake, and echoes every application message it
//! receives back to its sender. Not the router layer (spec.md §1) — just
//! enough to dial, handshake, and bounce a payload for manual exercise.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use rt_transport_core::{Event, EventKind, Server};
use rt_wire::PartialMessage;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-server", version, about = "rt-transport-core echo server demo")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:7878")]
    listen: String,

    #[arg(long, default_value = "server")]
    peer_id: String,

    /// Optional TOML file overriding `TransportConfig` defaults (see
    /// `rt_demo::config::RawDemoConfig`). Unset fields keep their default.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(peer_id = %args.peer_id, listen = %args.listen, "echo-server starting");

    let raw_config = rt_demo::config::load_raw(args.config.as_deref()).expect("load config");
    let transport_config = rt_demo::config::resolve(raw_config);

    let server = Server::new(args.peer_id.clone(), transport_config);

    let echo_server = server.clone();
    server.add_event_listener(EventKind::Message, move |event| {
        let Event::Message(msg) = event else { return };
        if msg.control_flags.is_ack() {
            return;
        }
        let rt_wire::Payload::App(payload) = msg.payload.clone() else {
            return;
        };
        let to = msg.from.clone();
        let stream_id = msg.stream_id.clone();
        let server = echo_server.clone();
        tokio::spawn(async move {
            let _ = server.send(&to, PartialMessage::app(to.clone(), stream_id, payload)).await;
        });
    });

    let app = Router::new()
        .route("/ws", get(upgrade_handler))
        .with_state(server);

    let listener = tokio::net::TcpListener::bind(&args.listen).await.expect("bind listener");
    info!(listen = %args.listen, "listening");
    axum::serve(listener, app).await.expect("serve");
}

async fn upgrade_handler(ws: WebSocketUpgrade, State(server): State<Arc<Server>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let established = rt_ws_carrier::accept_established(socket);
        server.handle_connection(established).await;
    })
}
