pub mod adapter;
pub mod broadcast;
mod context;
pub mod coordinator;
pub mod errors;
pub mod peer;
pub mod registry;
pub mod transport;

pub use adapter::ClusterAdapter;
pub use broadcast::BroadcastEngine;
pub use coordinator::{PeerReply, PendingResponse, RequestCoordinator};
pub use errors::{AdapterError, TransportError};
pub use peer::{PeerRequestHandler, ServerEventHandler};
pub use registry::{AckSender, ClientMessage, LocalRegistry, MemoryRegistry};
pub use transport::{MemoryBus, Transport, TransportMessage};
