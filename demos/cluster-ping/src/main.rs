//! Two nodes of a cluster on one machine: a gateway dials a scene over
//! WebSocket, chats a little and measures request round trips.
//!
//! ```text
//! cargo run -p cluster-ping                 # defaults
//! cargo run -p cluster-ping -- node.toml    # gateway config from TOML
//! RUST_LOG=relayforge=debug cargo run -p cluster-ping
//! ```

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use relayforge::prelude::*;
use relayforge_transport::{ShutdownHandle, Transport, WebSocketTransport};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHAT: MessageType = MessageType(1);
const PING: MessageType = MessageType(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Chat {
    from: String,
    text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    n: u32,
    sent_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Pong {
    n: u32,
    scene: String,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A running scene: the node, its URL and a way to stop its listener.
struct Scene {
    node: Node,
    url: String,
    listener: ShutdownHandle,
}

async fn start_scene(bind: &str) -> Result<Scene, Box<dyn std::error::Error>> {
    let links = WebSocketLinks::new("scene-1")?;
    let node = Node::builder("scene-1")
        .loops(2)
        .outbound(Arc::new(links.clone()))
        .on_message(CHAT, |ctx, env| match serde_json::from_slice::<Chat>(&env.payload) {
            Ok(chat) => info!(session = %ctx.session_id(), from = %chat.from, text = %chat.text, "chat"),
            Err(e) => tracing::warn!(error = %e, "bad chat payload"),
        })
        .on_request(PING, |ctx, req| {
            let ping: Ping = serde_json::from_slice(&req.payload).map_err(|e| e.to_string())?;
            let pong = Pong {
                n: ping.n,
                scene: ctx.node_name().to_string(),
            };
            serde_json::to_vec(&pong).map_err(|e| e.to_string())
        })
        .on_session_closed(|id, reason| info!(session = %id, %reason, "scene session closed"))
        .build()?;
    links.attach(&node);

    let transport = WebSocketTransport::bind(bind).await?;
    let url = format!("ws://{}", transport.local_addr()?);
    let listener = transport.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = links.serve(transport).await {
            tracing::error!(error = %e, "scene listener stopped");
        }
    });
    Ok(Scene {
        node,
        url,
        listener,
    })
}

fn start_gateway(config: NodeConfig) -> Result<Node, Box<dyn std::error::Error>> {
    let links = WebSocketLinks::new(config.name.clone())?;
    let node = Node::builder(config.name.clone())
        .config(config)
        .outbound(Arc::new(links.clone()))
        .on_session_closed(|id, reason| info!(session = %id, %reason, "gateway session closed"))
        .build()?;
    links.attach(&node);
    Ok(node)
}

async fn ping(session: &SessionHandle, n: u32) -> Result<(Pong, Duration), Box<dyn std::error::Error>> {
    let sent = SystemTime::now();
    let sent_ms = sent.duration_since(UNIX_EPOCH)?.as_millis();
    let payload = serde_json::to_vec(&Ping { n, sent_ms })?;
    let response = session
        .call(PING, payload, Some(Duration::from_secs(2)))
        .await?;
    let pong: Pong = serde_json::from_slice(&response.payload)?;
    Ok((pong, sent.elapsed()?))
}

fn gateway_config() -> Result<NodeConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let source = std::fs::read_to_string(&path)?;
            let config = NodeConfig::from_toml_str(&source)?;
            info!(%path, name = %config.name, "loaded gateway config");
            Ok(config)
        }
        None => Ok(NodeConfig {
            name: "gateway-1".to_string(),
            node_id: 1,
            loops: 2,
            ..NodeConfig::default()
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let scene = start_scene("127.0.0.1:0").await?;
    let gateway = start_gateway(gateway_config()?)?;
    info!(url = %scene.url, "gateway dialing scene");

    let session = gateway.connect(scene.url.clone())?;
    for text in ["hello", "from", "the gateway"] {
        let chat = Chat {
            from: gateway.name().to_string(),
            text: text.to_string(),
        };
        session.send(CHAT, serde_json::to_vec(&chat)?).await?;
    }
    for n in 1..=5 {
        let (pong, rtt) = ping(&session, n).await?;
        info!(n = pong.n, scene = %pong.scene, ?rtt, "pong");
    }

    info!(gateway = ?gateway.metrics(), scene = ?scene.node.metrics(), "done");
    session.close().await?;
    gateway.shutdown()?;
    scene.listener.shutdown();
    scene.node.shutdown()?;
    Ok(())
}
