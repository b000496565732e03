//! Wire format exchanged between nodes.
//!
//! Every message is an [`Envelope`]: the sender's [`NodeId`] plus one of
//! three message kinds. Plain broadcasts travel on the broadcast channel;
//! requests and responses travel on the request/response channels and are
//! correlated by [`RequestId`]. Envelopes are JSON encoded.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::{NodeId, RequestId, Room, SocketId};
use crate::packet::{BroadcastOptions, Packet, SocketDetails};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Node that published this envelope.
    pub uid: NodeId,
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Message {
    Broadcast {
        packet: Packet,
        opts: BroadcastOptions,
    },
    /// Fire-and-forget requests carry no request id.
    Request {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        request: Request,
    },
    Response {
        request_id: RequestId,
        response: Response,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    Sockets {
        rooms: HashSet<Room>,
    },
    AllRooms,
    RemoteJoin {
        sid: SocketId,
        room: Room,
    },
    RemoteLeave {
        sid: SocketId,
        room: Room,
    },
    RemoteDisconnect {
        sid: SocketId,
        close: bool,
    },
    FetchSockets {
        opts: BroadcastOptions,
    },
    AddSockets {
        opts: BroadcastOptions,
        rooms: Vec<Room>,
    },
    DelSockets {
        opts: BroadcastOptions,
        rooms: Vec<Room>,
    },
    DisconnectSockets {
        opts: BroadcastOptions,
        close: bool,
    },
    ServerSideEmit {
        event: Packet,
    },
    BroadcastWithAck {
        packet: Packet,
        opts: BroadcastOptions,
    },
}

impl Request {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Sockets { .. } => "sockets",
            Self::AllRooms => "allRooms",
            Self::RemoteJoin { .. } => "remoteJoin",
            Self::RemoteLeave { .. } => "remoteLeave",
            Self::RemoteDisconnect { .. } => "remoteDisconnect",
            Self::FetchSockets { .. } => "fetchSockets",
            Self::AddSockets { .. } => "addSockets",
            Self::DelSockets { .. } => "delSockets",
            Self::DisconnectSockets { .. } => "disconnectSockets",
            Self::ServerSideEmit { .. } => "serverSideEmit",
            Self::BroadcastWithAck { .. } => "broadcastWithAck",
        }
    }
}

/// A node's local contribution to a distributed request. The responding
/// node is the envelope's `uid`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Response {
    Sockets {
        sockets: Vec<SocketId>,
    },
    AllRooms {
        rooms: Vec<Room>,
    },
    FetchSockets {
        sockets: Vec<SocketDetails>,
    },
    /// Answer to a remote join/leave/disconnect. `applied` is true only on
    /// the node that owns the socket.
    RemoteOp {
        applied: bool,
    },
    ServerSideEmit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    BroadcastClientCount {
        client_count: usize,
    },
    BroadcastAck {
        ack: Value,
    },
}

impl Response {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Sockets { .. } => "sockets",
            Self::AllRooms { .. } => "allRooms",
            Self::FetchSockets { .. } => "fetchSockets",
            Self::RemoteOp { .. } => "remoteOp",
            Self::ServerSideEmit { .. } => "serverSideEmit",
            Self::BroadcastClientCount { .. } => "broadcastClientCount",
            Self::BroadcastAck { .. } => "broadcastAck",
        }
    }
}

impl Envelope {
    pub fn broadcast(uid: NodeId, packet: Packet, opts: BroadcastOptions) -> Self {
        Self {
            uid,
            message: Message::Broadcast { packet, opts },
        }
    }

    pub fn request(uid: NodeId, request_id: Option<RequestId>, request: Request) -> Self {
        Self {
            uid,
            message: Message::Request {
                request_id,
                request,
            },
        }
    }

    pub fn response(uid: NodeId, request_id: RequestId, response: Response) -> Self {
        Self {
            uid,
            message: Message::Response {
                request_id,
                response,
            },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Decode)
    }
}
