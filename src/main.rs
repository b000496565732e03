//! # roomcast
//!
//! Boots an in-memory cluster of roomcast nodes on one shared bus, connects
//! some clients to each, and prints the results of the distributed
//! operations as seen from the first node.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use futures::future::try_join_all;
use roomcast_adapter::{
    ClientMessage, ClusterAdapter, LocalRegistry, MemoryBus, MemoryRegistry, ServerEventHandler,
};
use roomcast_core::{load_settings, AdapterSettings, BroadcastOptions, NodeId, Packet, Room};
use roomcast_telemetry::{init_telemetry, TelemetryConfig};
use serde_json::{json, Value};

/// In-memory roomcast cluster demo.
#[derive(Parser, Debug)]
#[command(name = "roomcast", about = "Run an in-memory roomcast cluster")]
struct Cli {
    /// Number of nodes in the cluster.
    #[arg(long, default_value = "3")]
    nodes: usize,

    /// Clients connected to each node.
    #[arg(long, default_value = "2")]
    sockets_per_node: usize,

    /// Namespace every node serves.
    #[arg(long, default_value = "/")]
    namespace: String,

    /// JSON settings file layered over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Answer requests on the requester's own response channel.
    #[arg(long)]
    per_node_responses: bool,

    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

struct Node {
    adapter: ClusterAdapter,
    registry: Arc<MemoryRegistry>,
}

/// Answers server-side events with the receiving node's index.
struct NodeGreeter {
    index: usize,
}

#[async_trait]
impl ServerEventHandler for NodeGreeter {
    async fn on_event(&self, origin: &NodeId, event: Packet) -> Result<Value, String> {
        tracing::info!(
            index = self.index,
            origin = %origin,
            event = %event.event,
            "server-side event"
        );
        Ok(json!({ "node": self.index, "event": event.event }))
    }
}

async fn start_node(
    index: usize,
    bus: &MemoryBus,
    namespace: &str,
    settings: &AdapterSettings,
) -> Result<Node> {
    let registry = Arc::new(MemoryRegistry::default());
    let adapter = ClusterAdapter::start(
        namespace,
        settings,
        Arc::new(bus.clone()),
        Arc::clone(&registry) as Arc<dyn LocalRegistry>,
    )
    .await
    .with_context(|| format!("failed to start node {index}"))?;
    adapter.set_server_event_handler(NodeGreeter { index });
    Ok(Node { adapter, registry })
}

/// Connect `count` clients that ack every packet with their own id.
fn connect_clients(node_index: usize, registry: &MemoryRegistry, count: usize) {
    for client in 0..count {
        let (sid, mut rx) = registry.connect(json!({ "node": node_index, "client": client }));
        let _ = registry.join(&sid, &Room::new(format!("room-{}", client % 2)));
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    ClientMessage::Event { ack: Some(ack), .. } => ack.send(json!(sid)),
                    ClientMessage::Event { ack: None, .. } => {}
                    ClientMessage::Disconnect { .. } => break,
                }
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let _ = init_telemetry(&TelemetryConfig {
        json: args.json_logs,
        ..TelemetryConfig::default()
    });
    anyhow::ensure!(args.nodes > 0, "--nodes must be at least 1");

    let mut settings = load_settings(args.config.as_deref()).context("failed to load settings")?;
    if args.per_node_responses {
        settings.publish_on_specific_response_channel = true;
    }

    let bus = MemoryBus::default();
    let nodes =
        try_join_all((0..args.nodes).map(|i| start_node(i, &bus, &args.namespace, &settings)))
            .await?;
    for (index, node) in nodes.iter().enumerate() {
        connect_clients(index, &node.registry, args.sockets_per_node);
    }
    tracing::info!(
        nodes = nodes.len(),
        sockets_per_node = args.sockets_per_node,
        "cluster ready"
    );

    let origin = &nodes[0].adapter;
    let mut rooms: Vec<String> = origin
        .all_rooms()
        .await?
        .into_iter()
        .map(|r| r.as_str().to_owned())
        .filter(|r| r.starts_with("room-"))
        .collect();
    rooms.sort();

    let sockets = origin.fetch_sockets(BroadcastOptions::to_rooms(["room-0"])).await?;

    let replies: Vec<Value> = origin
        .server_side_emit_with_ack(Packet::new("hello", vec![]))
        .await?
        .await?
        .into_iter()
        .map(|reply| match reply.result {
            Ok(value) => json!({ "node": reply.node_id, "reply": value }),
            Err(error) => json!({ "node": reply.node_id, "error": error }),
        })
        .collect();

    let acks = origin
        .broadcast_with_ack(Packet::new("ping", vec![]), BroadcastOptions::all())
        .await?
        .await?;

    let report = json!({
        "nodeId": origin.node_id(),
        "namespace": origin.namespace(),
        "channels": {
            "broadcast": origin.channels().broadcast,
            "request": origin.channels().request,
            "response": origin.channels().response,
        },
        "allRooms": rooms,
        "fetchSockets": sockets,
        "serverSideEmit": replies,
        "broadcastAcks": acks.len(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    for node in &nodes {
        node.adapter.shutdown().await;
    }
    Ok(())
}
