//! Terminal chat over an in-process pubsub mesh.
//!
//! Starts one interactive session plus `--peers` scripted peers on the same
//! mesh. Each line typed is published to the topic; `/name NEW` changes the
//! display name and `/quit` exits.
//!
//!   cargo run -p pubchat-demo-chat -- --peers 2 --store ./pubchat.json
//!   cargo run -p pubchat-demo-chat -- --offline

mod render;

use clap::Parser;
use pubchat_session::{
    ChatSession, FileStore, KeyValueStore, MemoryHub, MemoryStore, PubSub, SessionConfig,
    TransportSlot,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "chat", about = "Chat on a single pubsub topic")]
struct Args {
    /// TOML session config.
    #[arg(long, env = "PUBCHAT_CONFIG")]
    config: Option<PathBuf>,
    /// Number of scripted peers joining the mesh.
    #[arg(long, default_value_t = 1)]
    peers: usize,
    /// Display name to use (persisted to the store).
    #[arg(long)]
    name: Option<String>,
    /// JSON file the display name is persisted in. In-memory if omitted.
    #[arg(long, env = "PUBCHAT_STORE")]
    store: Option<PathBuf>,
    /// Start with no pubsub transport at all.
    #[arg(long)]
    offline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chat=info".parse()?))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => SessionConfig::load(path)?,
        None => SessionConfig::default(),
    };
    let store: Arc<dyn KeyValueStore> = match &args.store {
        Some(path) => {
            let store = FileStore::open(path)?;
            tracing::info!(path = %store.path().display(), "Persisting display name");
            Arc::new(store)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let hub = MemoryHub::new();
    let transport = Arc::new(TransportSlot::empty());
    if !args.offline {
        transport.set(Arc::new(hub.node("local")));
    }

    let session = ChatSession::new(config.clone(), transport, store);
    let renderer = tokio::spawn(render::run(session.subscribe()));

    tracing::info!(topic = %session.config().topic, peers = args.peers, "Starting chat");
    session.startup().await;
    if let Some(name) = args.name {
        session.set_display_name(name);
    }

    let mut peers = Vec::with_capacity(args.peers);
    for i in 0..args.peers {
        let name = format!("peer-{i}");
        let node = hub.node(name.as_str());
        tracing::debug!(identity = %node.identity(), "Peer joining");
        let node: Arc<dyn PubSub> = Arc::new(node);
        let peer = ChatSession::new(
            config.clone(),
            Arc::new(TransportSlot::with(node)),
            Arc::new(MemoryStore::new()),
        );
        peer.startup().await;
        peer.set_display_name(name.as_str());
        peer.set_draft(format!("hello from {name}"));
        peer.send().await;
        peers.push(peer);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line == "/quit" {
            break;
        }
        if let Some(name) = line.strip_prefix("/name ") {
            session.set_display_name(name);
            continue;
        }
        session.set_draft(line);
        session.send().await;
    }

    session.shutdown().await;
    for peer in &peers {
        peer.shutdown().await;
    }

    // Dropping the session closes the observer channel and ends the renderer.
    drop(session);
    renderer.await?;
    Ok(())
}
