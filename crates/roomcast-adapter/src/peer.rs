//! Execution of requests published by other nodes.
//!
//! Each request is run against the local registry and answered on the
//! requester's response channel with this node's contribution, which may be
//! empty. Requests without an id are fire-and-forget and never answered.
//! Work that waits on application code or client acks runs on its own task.

use std::sync::Arc;

use async_trait::async_trait;
use roomcast_core::{BroadcastOptions, NodeId, Packet, Request, RequestId, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::broadcast::forward_acks;
use crate::context::NodeContext;

/// Application hook for events emitted with `server_side_emit`.
///
/// An `Err` is carried back to the emitting node as that peer's error entry.
#[async_trait]
pub trait ServerEventHandler: Send + Sync + 'static {
    async fn on_event(&self, origin: &NodeId, event: Packet) -> Result<Value, String>;
}

pub struct PeerRequestHandler {
    ctx: Arc<NodeContext>,
}

impl PeerRequestHandler {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn handle(
        &self,
        from: NodeId,
        request_id: Option<RequestId>,
        request: Request,
    ) {
        trace!(
            origin = %from,
            request_id = ?request_id,
            request_type = request.type_name(),
            "peer request received"
        );
        let registry = &self.ctx.registry;
        match request {
            Request::Sockets { rooms } => {
                let sockets = registry
                    .matching_sockets(&BroadcastOptions::to_rooms(rooms))
                    .into_iter()
                    .collect();
                self.reply(&from, request_id, Response::Sockets { sockets }).await;
            }
            Request::AllRooms => {
                let rooms = registry.all_rooms().into_iter().collect();
                self.reply(&from, request_id, Response::AllRooms { rooms }).await;
            }
            Request::FetchSockets { opts } => {
                let sockets = registry.fetch_sockets(&opts);
                self.reply(&from, request_id, Response::FetchSockets { sockets }).await;
            }
            Request::RemoteJoin { sid, room } => {
                let applied = registry.join(&sid, &room);
                self.reply(&from, request_id, Response::RemoteOp { applied }).await;
            }
            Request::RemoteLeave { sid, room } => {
                let applied = registry.leave(&sid, &room);
                self.reply(&from, request_id, Response::RemoteOp { applied }).await;
            }
            Request::RemoteDisconnect { sid, close } => {
                let applied = registry.disconnect(&sid, close);
                self.reply(&from, request_id, Response::RemoteOp { applied }).await;
            }
            Request::AddSockets { opts, rooms } => registry.add_sockets(&opts, &rooms),
            Request::DelSockets { opts, rooms } => registry.del_sockets(&opts, &rooms),
            Request::DisconnectSockets { opts, close } => {
                registry.disconnect_sockets(&opts, close);
            }
            Request::ServerSideEmit { event } => {
                self.server_side_emit(from, request_id, event).await;
            }
            Request::BroadcastWithAck { packet, opts } => {
                self.broadcast_with_ack(from, request_id, &packet, &opts).await;
            }
        }
    }

    async fn reply(&self, requester: &NodeId, request_id: Option<RequestId>, response: Response) {
        match request_id {
            Some(request_id) => self.ctx.respond(requester, request_id, response).await,
            None => debug!(
                origin = %requester,
                response_type = response.type_name(),
                "request carries no id, not answering"
            ),
        }
    }

    async fn server_side_emit(&self, from: NodeId, request_id: Option<RequestId>, event: Packet) {
        let Some(handler) = self.ctx.server_handler() else {
            debug!(origin = %from, event = %event.event, "no server-side event handler registered");
            let response = Response::ServerSideEmit {
                reply: None,
                error: Some("no server-side event handler registered".into()),
            };
            self.reply(&from, request_id, response).await;
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let origin = from.clone();
            let event_name = event.event.clone();
            // A panicking handler ends its own task only.
            let call = tokio::spawn(async move { handler.on_event(&origin, event).await });
            let result = match call.await {
                Ok(result) => result,
                Err(join_error) => Err(format!("server-side event handler failed: {join_error}")),
            };

            match request_id {
                Some(request_id) => {
                    let response = match result {
                        Ok(reply) => Response::ServerSideEmit {
                            reply: Some(reply),
                            error: None,
                        },
                        Err(error) => Response::ServerSideEmit {
                            reply: None,
                            error: Some(error),
                        },
                    };
                    ctx.respond(&from, request_id, response).await;
                }
                None => {
                    if let Err(error) = result {
                        warn!(
                            origin = %from,
                            event = %event_name,
                            error = %error,
                            "server-side event handler failed"
                        );
                    }
                }
            }
        });
    }

    /// Deliver locally, report the client count at once, then forward each
    /// client ack as it arrives until the request timeout.
    async fn broadcast_with_ack(
        &self,
        from: NodeId,
        request_id: Option<RequestId>,
        packet: &Packet,
        opts: &BroadcastOptions,
    ) {
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();
        let client_count = self.ctx.registry.deliver_with_ack(packet, opts, ack_tx);
        let Some(request_id) = request_id else {
            debug!(origin = %from, "broadcast with ack carries no id, acks discarded");
            return;
        };
        self.ctx
            .respond(&from, request_id.clone(), Response::BroadcastClientCount { client_count })
            .await;
        if client_count == 0 {
            return;
        }

        let ctx = Arc::clone(&self.ctx);
        let deadline = Instant::now() + ctx.coordinator.timeout();
        tokio::spawn(forward_acks(ack_rx, deadline, move |ack| {
            let ctx = Arc::clone(&ctx);
            let requester = from.clone();
            let request_id = request_id.clone();
            async move {
                ctx.respond(&requester, request_id, Response::BroadcastAck { ack })
                    .await;
                !ctx.shutdown.is_cancelled()
            }
        }));
    }
}
