//! The per-namespace cluster adapter.
//!
//! [`ClusterAdapter`] owns one subscription to the namespace's channels and a
//! single listener task that routes every inbound envelope: broadcasts go to
//! the local registry, requests to the [`PeerRequestHandler`], responses to
//! the [`RequestCoordinator`](crate::coordinator::RequestCoordinator). The
//! node's own envelopes are dropped on arrival.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use roomcast_core::{
    AdapterSettings, BroadcastOptions, Channels, Envelope, Message, NodeId, Packet, Request, Room,
    SocketDetails, SocketId,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broadcast::BroadcastEngine;
use crate::context::NodeContext;
use crate::coordinator::{Accumulator, PeerReply, PendingResponse};
use crate::errors::Result;
use crate::peer::{PeerRequestHandler, ServerEventHandler};
use crate::registry::LocalRegistry;
use crate::transport::{Transport, TransportMessage};

pub struct ClusterAdapter {
    ctx: Arc<NodeContext>,
    engine: BroadcastEngine,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterAdapter {
    /// Subscribe to the namespace's channels under a fresh node id and start
    /// the listener.
    pub async fn start(
        namespace: &str,
        settings: &AdapterSettings,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn LocalRegistry>,
    ) -> Result<Self> {
        Self::start_with_id(NodeId::new(), namespace, settings, transport, registry).await
    }

    pub async fn start_with_id(
        node_id: NodeId,
        namespace: &str,
        settings: &AdapterSettings,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn LocalRegistry>,
    ) -> Result<Self> {
        let ctx = Arc::new(NodeContext::new(node_id, namespace, settings, transport, registry));
        let subscriptions = ctx.channels.subscriptions();
        let rx = ctx.transport.subscribe(&subscriptions).await?;
        let listener = spawn_listener(Arc::clone(&ctx), rx);

        info!(
            node_id = %ctx.node_id,
            namespace = %ctx.namespace,
            channels = ?subscriptions,
            per_node_responses = ctx.channels.per_node(),
            timeout_ms = ctx.coordinator.timeout().as_millis() as u64,
            "cluster adapter started"
        );

        Ok(Self {
            engine: BroadcastEngine::new(Arc::clone(&ctx)),
            ctx,
            listener: Mutex::new(Some(listener)),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.ctx.node_id
    }

    pub fn namespace(&self) -> &str {
        &self.ctx.namespace
    }

    pub fn channels(&self) -> &Channels {
        &self.ctx.channels
    }

    /// Install the hook that runs events emitted by other nodes with
    /// `server_side_emit`. Replaces any previous handler.
    pub fn set_server_event_handler<H: ServerEventHandler>(&self, handler: H) {
        *self.ctx.server_handler.write() = Some(Arc::new(handler));
    }

    /// Subscriber count of the request channel, this node included.
    pub async fn num_sub(&self) -> Option<usize> {
        self.ctx.transport.subscriber_count(&self.ctx.channels.request).await
    }

    /// Number of distributed requests still waiting on peers.
    pub fn pending_requests(&self) -> usize {
        self.ctx.coordinator.pending_count()
    }

    // =========================================================================
    // Distributed queries
    // =========================================================================

    /// Ids of the sockets in any of `rooms` (all sockets if empty) across
    /// the cluster.
    pub async fn sockets<I>(&self, rooms: I) -> Result<HashSet<SocketId>>
    where
        I: IntoIterator<Item = Room>,
    {
        self.ctx.ensure_running()?;
        let rooms: HashSet<Room> = rooms.into_iter().collect();
        let local = self
            .ctx
            .registry
            .matching_sockets(&BroadcastOptions::to_rooms(rooms.iter().cloned()));
        let expected = self.ctx.peer_count().await;
        if expected == Some(0) {
            return Ok(local);
        }
        self.ctx
            .request(Request::Sockets { rooms }, Accumulator::Sockets(local), expected)
            .await?
            .await
    }

    /// Every room with at least one member anywhere in the cluster.
    pub async fn all_rooms(&self) -> Result<HashSet<Room>> {
        self.ctx.ensure_running()?;
        let local = self.ctx.registry.all_rooms();
        let expected = self.ctx.peer_count().await;
        if expected == Some(0) {
            return Ok(local);
        }
        self.ctx
            .request(Request::AllRooms, Accumulator::Rooms(local), expected)
            .await?
            .await
    }

    /// Descriptors of the sockets matching `opts` across the cluster, or on
    /// this node only with the `local` flag.
    pub async fn fetch_sockets(&self, opts: BroadcastOptions) -> Result<Vec<SocketDetails>> {
        self.ctx.ensure_running()?;
        let local = self.ctx.registry.fetch_sockets(&opts);
        if opts.flags.local {
            return Ok(local);
        }
        let expected = self.ctx.peer_count().await;
        if expected == Some(0) {
            return Ok(local);
        }
        self.ctx
            .request(
                Request::FetchSockets { opts },
                Accumulator::fetch_sockets(local),
                expected,
            )
            .await?
            .await
    }

    // =========================================================================
    // Single-socket operations
    // =========================================================================

    /// Make socket `sid`, wherever it is connected, join `room`. An unknown
    /// socket is not an error.
    pub async fn remote_join(&self, sid: SocketId, room: Room) -> Result<()> {
        self.ctx.ensure_running()?;
        if self.ctx.registry.join(&sid, &room) {
            return Ok(());
        }
        self.remote_op(Request::RemoteJoin { sid, room }).await
    }

    pub async fn remote_leave(&self, sid: SocketId, room: Room) -> Result<()> {
        self.ctx.ensure_running()?;
        if self.ctx.registry.leave(&sid, &room) {
            return Ok(());
        }
        self.remote_op(Request::RemoteLeave { sid, room }).await
    }

    pub async fn remote_disconnect(&self, sid: SocketId, close: bool) -> Result<()> {
        self.ctx.ensure_running()?;
        if self.ctx.registry.disconnect(&sid, close) {
            return Ok(());
        }
        self.remote_op(Request::RemoteDisconnect { sid, close }).await
    }

    async fn remote_op(&self, request: Request) -> Result<()> {
        let expected = self.ctx.peer_count().await;
        if expected == Some(0) {
            trace!(request_type = request.type_name(), "socket unknown and no peers");
            return Ok(());
        }
        self.ctx
            .request(request, Accumulator::RemoteOp { applied: false }, expected)
            .await?
            .await
    }

    // =========================================================================
    // Broadcast and bulk operations
    // =========================================================================

    pub async fn broadcast(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<Option<PendingResponse<Vec<Value>>>> {
        self.engine.broadcast(packet, opts).await
    }

    pub async fn broadcast_with_ack(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<PendingResponse<Vec<Value>>> {
        self.engine.broadcast_with_ack(packet, opts).await
    }

    pub async fn server_side_emit(&self, event: Packet) -> Result<()> {
        self.engine.server_side_emit(event).await
    }

    pub async fn server_side_emit_with_ack(
        &self,
        event: Packet,
    ) -> Result<PendingResponse<Vec<PeerReply>>> {
        self.engine.server_side_emit_with_ack(event).await
    }

    pub async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<()> {
        self.engine.add_sockets(opts, rooms).await
    }

    pub async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<()> {
        self.engine.del_sockets(opts, rooms).await
    }

    pub async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) -> Result<()> {
        self.engine.disconnect_sockets(opts, close).await
    }

    /// Stop the listener and resolve every pending request with what it has
    /// accumulated. Every later operation fails with
    /// [`AdapterError::Shutdown`](crate::errors::AdapterError::Shutdown).
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(error) = listener.await {
                warn!(node_id = %self.ctx.node_id, error = %error, "listener task failed");
            }
        }
        let resolved = self.ctx.coordinator.shutdown();
        info!(node_id = %self.ctx.node_id, resolved, "cluster adapter shut down");
    }
}

impl Drop for ClusterAdapter {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

// =============================================================================
// Listener
// =============================================================================

fn spawn_listener(
    ctx: Arc<NodeContext>,
    mut rx: mpsc::Receiver<TransportMessage>,
) -> JoinHandle<()> {
    let engine = BroadcastEngine::new(Arc::clone(&ctx));
    let peer = PeerRequestHandler::new(Arc::clone(&ctx));

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = ctx.shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => dispatch(&ctx, &engine, &peer, message).await,
                    None => {
                        info!(node_id = %ctx.node_id, "subscription closed");
                        break;
                    }
                },
            }
        }
        debug!(node_id = %ctx.node_id, "listener stopped");
    })
}

async fn dispatch(
    ctx: &NodeContext,
    engine: &BroadcastEngine,
    peer: &PeerRequestHandler,
    message: TransportMessage,
) {
    let envelope = match Envelope::decode(&message.payload) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(channel = %message.channel, error = %error, "dropping undecodable envelope");
            return;
        }
    };
    if envelope.uid == ctx.node_id {
        trace!(channel = %message.channel, "ignoring own envelope");
        return;
    }

    match envelope.message {
        Message::Broadcast { packet, opts } => {
            engine.on_broadcast(&envelope.uid, &packet, &opts);
        }
        Message::Request {
            request_id,
            request,
        } => peer.handle(envelope.uid, request_id, request).await,
        Message::Response { request_id, response } => {
            let _ = ctx.coordinator.on_response(&envelope.uid, &request_id, response);
        }
    }
}
