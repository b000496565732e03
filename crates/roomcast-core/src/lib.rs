//! # roomcast-core
//!
//! Shared vocabulary of the roomcast cluster adapter: node/request/socket
//! identifiers, pub/sub channel naming, broadcast options, the inter-node wire
//! protocol and adapter settings.

#![deny(unsafe_code)]

pub mod channels;
pub mod errors;
pub mod ids;
pub mod packet;
pub mod protocol;
pub mod settings;

pub use channels::Channels;
pub use errors::{ProtocolError, SettingsError};
pub use ids::{NodeId, RequestId, Room, SocketId};
pub use packet::{BroadcastFlags, BroadcastOptions, Packet, SocketDetails};
pub use protocol::{Envelope, Message, Request, Response};
pub use settings::{load_settings, AdapterSettings};
