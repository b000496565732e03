//! Local-first broadcast with optional fan-out to peers.
//!
//! Every operation applies to this node's registry before anything goes on
//! the wire, so local clients never wait on the transport. The `local` flag
//! stops there.

use std::future::Future;
use std::sync::Arc;

use roomcast_core::{BroadcastOptions, Envelope, NodeId, Packet, Request, RequestId, Room};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::context::NodeContext;
use crate::coordinator::{Accumulator, PeerReply, PendingResponse};
use crate::errors::Result;

/// Fans packets and bulk room operations out to local clients and peers.
#[derive(Clone)]
pub struct BroadcastEngine {
    ctx: Arc<NodeContext>,
}

impl BroadcastEngine {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Deliver `packet` to every matching client in the cluster.
    ///
    /// With `expect_ack` set this behaves like [`broadcast_with_ack`] and
    /// returns the pending ack collection.
    ///
    /// [`broadcast_with_ack`]: Self::broadcast_with_ack
    pub async fn broadcast(
        &self,
        packet: Packet,
        opts: BroadcastOptions,
    ) -> Result<Option<PendingResponse<Vec<Value>>>> {
        if opts.flags.expect_ack {
            return self.broadcast_with_ack(packet, opts).await.map(Some);
        }
        self.ctx.ensure_running()?;

        let delivered = self.ctx.registry.deliver(&packet, &opts);
        trace!(
            event = %packet.event,
            delivered,
            local = opts.flags.local,
            "broadcast delivered locally"
        );
        if opts.flags.local {
            return Ok(None);
        }

        let envelope = Envelope::broadcast(self.ctx.node_id.clone(), packet, opts);
        self.ctx.publish(&self.ctx.channels.broadcast, &envelope).await?;
        Ok(None)
    }

    /// Deliver `packet` and collect one ack per client that received it,
    /// local clients included. Resolves once every peer reported its client
    /// count and every counted client acked, or at the request timeout.
    pub async fn broadcast_with_ack(
        &self,
        packet: Packet,
        mut opts: BroadcastOptions,
    ) -> Result<PendingResponse<Vec<Value>>> {
        self.ctx.ensure_running()?;
        opts.flags.expect_ack = true;

        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let local_clients = self.ctx.registry.deliver_with_ack(&packet, &opts, ack_tx);
        let expected = if opts.flags.local {
            Some(0)
        } else {
            self.ctx.peer_count().await
        };

        let request_id = RequestId::new();
        let pending = self.ctx.coordinator.register(
            request_id.clone(),
            Accumulator::acks(local_clients),
            expected,
        );
        debug!(
            request_id = %request_id,
            event = %packet.event,
            local_clients,
            expected_servers = ?expected,
            "broadcast with ack started"
        );
        self.spawn_local_ack_forwarder(request_id.clone(), ack_rx);

        if opts.flags.local {
            return Ok(pending);
        }
        let envelope = Envelope::request(
            self.ctx.node_id.clone(),
            Some(request_id.clone()),
            Request::BroadcastWithAck { packet, opts },
        );
        if let Err(error) = self.ctx.publish(&self.ctx.channels.request, &envelope).await {
            let _ = self.ctx.coordinator.finalize(&request_id);
            return Err(error);
        }
        Ok(pending)
    }

    fn spawn_local_ack_forwarder(
        &self,
        request_id: RequestId,
        acks: mpsc::UnboundedReceiver<Value>,
    ) {
        let coordinator = self.ctx.coordinator.clone();
        let deadline = Instant::now() + coordinator.timeout();
        tokio::spawn(forward_acks(acks, deadline, move |ack| {
            let accepted = coordinator.on_local_ack(&request_id, ack);
            async move { accepted }
        }));
    }

    /// Emit an application event to every other node. Nobody answers.
    pub async fn server_side_emit(&self, event: Packet) -> Result<()> {
        self.ctx.notify(Request::ServerSideEmit { event }).await
    }

    /// Emit an application event to every other node and collect each
    /// node's reply or error. Nodes that do not answer in time are absent.
    pub async fn server_side_emit_with_ack(
        &self,
        event: Packet,
    ) -> Result<PendingResponse<Vec<PeerReply>>> {
        self.ctx.ensure_running()?;
        let expected = self.ctx.peer_count().await;
        if expected == Some(0) {
            return Ok(PendingResponse::ready(Accumulator::Replies(Vec::new())));
        }
        self.ctx
            .request(
                Request::ServerSideEmit { event },
                Accumulator::Replies(Vec::new()),
                expected,
            )
            .await
    }

    /// Make every matching socket join `rooms`.
    pub async fn add_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx.registry.add_sockets(&opts, &rooms);
        if opts.flags.local {
            return Ok(());
        }
        self.ctx.notify(Request::AddSockets { opts, rooms }).await
    }

    /// Make every matching socket leave `rooms`.
    pub async fn del_sockets(&self, opts: BroadcastOptions, rooms: Vec<Room>) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx.registry.del_sockets(&opts, &rooms);
        if opts.flags.local {
            return Ok(());
        }
        self.ctx.notify(Request::DelSockets { opts, rooms }).await
    }

    pub async fn disconnect_sockets(&self, opts: BroadcastOptions, close: bool) -> Result<()> {
        self.ctx.ensure_running()?;
        self.ctx.registry.disconnect_sockets(&opts, close);
        if opts.flags.local {
            return Ok(());
        }
        self.ctx.notify(Request::DisconnectSockets { opts, close }).await
    }

    /// Apply a broadcast published by another node.
    pub(crate) fn on_broadcast(&self, from: &NodeId, packet: &Packet, opts: &BroadcastOptions) {
        let delivered = self.ctx.registry.deliver(packet, opts);
        trace!(origin = %from, event = %packet.event, delivered, "remote broadcast delivered");
    }
}

/// Pass client acks to `on_ack` until the sink closes, the deadline passes,
/// or `on_ack` returns `false`.
pub(crate) async fn forward_acks<F, Fut>(
    mut acks: mpsc::UnboundedReceiver<Value>,
    deadline: Instant,
    mut on_ack: F,
) where
    F: FnMut(Value) -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        match tokio::time::timeout_at(deadline, acks.recv()).await {
            Ok(Some(ack)) => {
                if !on_ack(ack).await {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing;
    use crate::registry::{ClientMessage, MemoryRegistry};
    use crate::transport::{MemoryBus, Transport};
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (MemoryBus, Arc<MemoryRegistry>, BroadcastEngine) {
        let bus = MemoryBus::default();
        let registry = Arc::new(MemoryRegistry::default());
        let ctx = testing::context(&bus, &registry);
        (bus, registry, BroadcastEngine::new(ctx))
    }

    fn packet() -> Packet {
        Packet::new("news", vec![json!("hello")])
    }

    #[tokio::test]
    async fn local_broadcast_never_publishes() {
        let (bus, registry, engine) = setup();
        let (_id, mut rx) = registry.connect(json!({}));

        let pending = engine
            .broadcast(packet(), BroadcastOptions::all().local())
            .await
            .unwrap();

        assert!(pending.is_none());
        assert_eq!(bus.publish_count(), 0);
        assert!(matches!(rx.try_recv().unwrap(), ClientMessage::Event { ack: None, .. }));
    }

    #[tokio::test]
    async fn broadcast_publishes_once_on_broadcast_channel() {
        let (bus, _registry, engine) = setup();
        let channel = engine.ctx.channels.broadcast.clone();
        let mut peer = bus.subscribe(&[channel.clone()]).await.unwrap();

        let _ = engine
            .broadcast(packet(), BroadcastOptions::to_rooms([Room::new("r1")]))
            .await
            .unwrap();

        assert_eq!(bus.publish_count(), 1);
        let msg = peer.recv().await.unwrap();
        let envelope = Envelope::decode(&msg.payload).unwrap();
        assert_eq!(envelope.uid, engine.ctx.node_id);
        match envelope.message {
            roomcast_core::Message::Broadcast { opts, .. } => {
                assert!(opts.rooms.contains(&Room::new("r1")));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_broadcast_with_ack_collects_local_acks() {
        let (bus, registry, engine) = setup();
        for _ in 0..2 {
            let (_id, mut rx) = registry.connect(json!({}));
            tokio::spawn(async move {
                if let Some(ClientMessage::Event { ack: Some(ack), .. }) = rx.recv().await {
                    ack.send(json!("ok"));
                }
            });
        }

        let pending = engine
            .broadcast(packet(), BroadcastOptions::all().local().with_ack())
            .await
            .unwrap()
            .unwrap();
        let acks = pending.await.unwrap();

        assert_eq!(acks, vec![json!("ok"), json!("ok")]);
        assert_eq!(bus.publish_count(), 0);
        assert_eq!(engine.ctx.coordinator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_clients_resolve_at_timeout() {
        let (_bus, registry, engine) = setup();
        let (_id, _rx) = registry.connect(json!({}));

        let started = Instant::now();
        let acks = engine
            .broadcast_with_ack(packet(), BroadcastOptions::all().local())
            .await
            .unwrap()
            .await
            .unwrap();

        assert!(acks.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn broadcast_with_ack_publishes_request() {
        let (bus, _registry, engine) = setup();
        let request_channel = engine.ctx.channels.request.clone();
        let mut peer = bus.subscribe(&[request_channel]).await.unwrap();

        let _pending = engine
            .broadcast_with_ack(packet(), BroadcastOptions::all())
            .await
            .unwrap();

        let envelope = Envelope::decode(&peer.recv().await.unwrap().payload).unwrap();
        match envelope.message {
            roomcast_core::Message::Request {
                request_id,
                request: Request::BroadcastWithAck { opts, .. },
            } => {
                assert!(request_id.is_some());
                assert!(opts.flags.expect_ack);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_side_emit_with_ack_without_peers_is_immediate() {
        let (bus, _registry, engine) = setup();
        let replies = engine
            .server_side_emit_with_ack(packet())
            .await
            .unwrap()
            .await
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn bulk_operations_apply_locally_and_notify() {
        let (bus, registry, engine) = setup();
        let (id, _rx) = registry.connect(json!({}));

        engine
            .add_sockets(BroadcastOptions::all(), vec![Room::new("lobby")])
            .await
            .unwrap();
        assert!(registry.rooms_of(&id).unwrap().contains(&Room::new("lobby")));
        assert_eq!(bus.publish_count_on(&engine.ctx.channels.request), 1);

        engine
            .del_sockets(BroadcastOptions::all().local(), vec![Room::new("lobby")])
            .await
            .unwrap();
        assert!(!registry.rooms_of(&id).unwrap().contains(&Room::new("lobby")));
        assert_eq!(bus.publish_count(), 1);
    }

    #[tokio::test]
    async fn failed_request_publish_withdraws_registration() {
        let (bus, registry, engine) = setup();
        let (_id, _rx) = registry.connect(json!({}));
        bus.close();

        let err = engine
            .server_side_emit_with_ack(packet())
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_kind(), "transport");
        assert_eq!(engine.ctx.coordinator.pending_count(), 0);

        let err = engine
            .broadcast_with_ack(packet(), BroadcastOptions::all())
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_kind(), "transport");
        assert_eq!(engine.ctx.coordinator.pending_count(), 0);

        let err = engine.server_side_emit(packet()).await.unwrap_err();
        assert_eq!(err.error_kind(), "transport");
    }

    #[tokio::test]
    async fn cancelled_engine_leaves_local_clients_untouched() {
        let (bus, registry, engine) = setup();
        let (_id, mut rx) = registry.connect(json!({}));
        engine.ctx.shutdown.cancel();

        assert!(engine
            .broadcast(packet(), BroadcastOptions::all().local())
            .await
            .is_err());
        assert!(engine
            .broadcast_with_ack(packet(), BroadcastOptions::all().local())
            .await
            .is_err());
        assert!(engine
            .del_sockets(BroadcastOptions::all().local(), vec![Room::new("x")])
            .await
            .is_err());

        assert!(rx.try_recv().is_err());
        assert_eq!(bus.publish_count(), 0);
        assert_eq!(engine.ctx.coordinator.pending_count(), 0);
    }
}
