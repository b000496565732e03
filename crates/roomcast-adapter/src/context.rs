//! State shared by the adapter facade, the broadcast engine and the peer
//! request handler of one node.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use roomcast_core::{AdapterSettings, Channels, Envelope, NodeId, Request, RequestId, Response};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::coordinator::{Accumulator, FromAccumulator, PendingResponse, RequestCoordinator};
use crate::errors::{AdapterError, Result};
use crate::peer::ServerEventHandler;
use crate::registry::LocalRegistry;
use crate::transport::Transport;

pub(crate) struct NodeContext {
    pub node_id: NodeId,
    pub namespace: String,
    pub channels: Channels,
    pub transport: Arc<dyn Transport>,
    pub registry: Arc<dyn LocalRegistry>,
    pub coordinator: RequestCoordinator,
    pub server_handler: RwLock<Option<Arc<dyn ServerEventHandler>>>,
    pub shutdown: CancellationToken,
}

impl NodeContext {
    pub fn new(
        node_id: NodeId,
        namespace: &str,
        settings: &AdapterSettings,
        transport: Arc<dyn Transport>,
        registry: Arc<dyn LocalRegistry>,
    ) -> Self {
        let channels = Channels::new(
            &settings.key_prefix,
            namespace,
            &node_id,
            settings.publish_on_specific_response_channel,
        );
        Self {
            node_id,
            namespace: namespace.to_owned(),
            channels,
            transport,
            registry,
            coordinator: RequestCoordinator::new(settings.requests_timeout()),
            server_handler: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Fails with [`AdapterError::Shutdown`] once the node stopped listening.
    pub fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(AdapterError::Shutdown);
        }
        Ok(())
    }

    pub async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<()> {
        self.ensure_running()?;
        let bytes = envelope.encode()?;
        trace!(channel, bytes = bytes.len(), "publishing");
        self.transport.publish(channel, Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Number of other nodes listening on the request channel, or `None`
    /// when the transport cannot count subscribers.
    pub async fn peer_count(&self) -> Option<usize> {
        self.transport
            .subscriber_count(&self.channels.request)
            .await
            .map(|n| n.saturating_sub(1))
    }

    /// Register a request seeded with the local contribution, then publish it
    /// on the request channel. A failed publish withdraws the registration.
    pub async fn request<T: FromAccumulator>(
        &self,
        request: Request,
        acc: Accumulator,
        expected: Option<usize>,
    ) -> Result<PendingResponse<T>> {
        self.ensure_running()?;
        let request_id = RequestId::new();
        let request_type = request.type_name();
        let pending = self.coordinator.register(request_id.clone(), acc, expected);
        let envelope =
            Envelope::request(self.node_id.clone(), Some(request_id.clone()), request);
        if let Err(error) = self.publish(&self.channels.request, &envelope).await {
            warn!(
                request_id = %request_id,
                request_type,
                error_kind = error.error_kind(),
                error = %error,
                "request publish failed"
            );
            let _ = self.coordinator.finalize(&request_id);
            return Err(error);
        }
        Ok(pending)
    }

    /// Publish a request that nobody answers.
    pub async fn notify(&self, request: Request) -> Result<()> {
        self.ensure_running()?;
        let envelope = Envelope::request(self.node_id.clone(), None, request);
        self.publish(&self.channels.request, &envelope).await
    }

    /// Answer `requester` on its response channel.
    pub async fn respond(&self, requester: &NodeId, request_id: RequestId, response: Response) {
        let channel = self.channels.response_for(requester);
        let response_type = response.type_name();
        let envelope = Envelope::response(self.node_id.clone(), request_id, response);
        if let Err(error) = self.publish(&channel, &envelope).await {
            warn!(
                requester = %requester,
                response_type,
                error = %error,
                "failed to publish response"
            );
        }
    }

    pub fn server_handler(&self) -> Option<Arc<dyn ServerEventHandler>> {
        self.server_handler.read().clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::transport::MemoryBus;
    use roomcast_core::Room;
    use std::collections::HashSet;

    #[tokio::test]
    async fn cancelled_node_refuses_to_publish_or_register() {
        let bus = MemoryBus::default();
        let registry = Arc::new(MemoryRegistry::default());
        let ctx = testing::context(&bus, &registry);
        let _peer = bus.subscribe(&[ctx.channels.request.clone()]).await.unwrap();
        ctx.shutdown.cancel();

        let err = ctx.notify(Request::AllRooms).await.unwrap_err();
        assert!(matches!(err, AdapterError::Shutdown));
        let err = ctx
            .request::<HashSet<Room>>(
                Request::AllRooms,
                Accumulator::Rooms(HashSet::new()),
                Some(1),
            )
            .await
            .err()
            .unwrap();
        assert_eq!(err.error_kind(), "shutdown");
        let reply = Response::RemoteOp { applied: false };
        ctx.respond(&NodeId::new(), RequestId::new(), reply).await;

        assert_eq!(bus.publish_count(), 0);
        assert_eq!(ctx.coordinator.pending_count(), 0);
    }
}
