//! Minimal echo client: dials an echo-server, sends one payload, and prints
//! whatever comes back. Exercises `rt_transport_core::Client` end-to-end
//! over a real `rt-ws-carrier` WebSocket connection.

use clap::Parser;
use rt_transport_core::{Event, EventKind};
use rt_wire::PartialMessage;
use rt_ws_carrier::WsDialer;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "echo-client", version, about = "rt-transport-core echo client demo")]
struct Args {
    #[arg(long, default_value = "ws://127.0.0.1:7878/ws")]
    server_url: String,

    #[arg(long, default_value = "server")]
    server_peer_id: String,

    #[arg(long, default_value = "client")]
    peer_id: String,

    #[arg(long, default_value = "hello from echo-client")]
    message: String,

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
    let mut addresses = HashMap::new();
    addresses.insert(args.server_peer_id.clone(), args.server_url.clone());
    let dialer = WsDialer::new(addresses);

    let raw_config = rt_demo::config::load_raw(args.config.as_deref()).expect("load config");
    let transport_config = rt_demo::config::resolve(raw_config);
    let client = rt_transport_core::Client::new(args.peer_id.clone(), dialer, transport_config);

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    client.add_event_listener(EventKind::Message, move |event| {
        if let Event::Message(msg) = event {
            if let rt_wire::Payload::App(payload) = &msg.payload {
                if let Some(tx) = tx.lock().expect("reply slot mutex poisoned").take() {
                    let _ = tx.send(payload.clone());
                }
            }
        }
    });

    info!(server = %args.server_peer_id, "connecting");
    client.connect(&args.server_peer_id).await.expect("connect");

    client
        .send(
            &args.server_peer_id,
            PartialMessage::app(args.server_peer_id.clone(), "echo-demo", serde_json::json!({ "text": args.message })),
        )
        .await
        .expect("send");

    match tokio::time::timeout(Duration::from_secs(5), rx).await {
        Ok(Ok(payload)) => println!("echoed back: {payload}"),
        Ok(Err(_)) => eprintln!("listener dropped before a reply arrived"),
        Err(_) => eprintln!("timed out waiting for echo"),
    }

    client.close().await;
}
