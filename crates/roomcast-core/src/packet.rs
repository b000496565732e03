use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{Room, SocketId};

/// An application event: a name plus its arguments. Opaque to the adapter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl Packet {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastFlags {
    /// Deliver on this node only.
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub volatile: bool,
    /// Collect client acknowledgements from every node.
    #[serde(default)]
    pub expect_ack: bool,
}

/// Which sockets a broadcast or bulk operation targets.
///
/// An empty `rooms` set means every socket. A socket matches when it is in at
/// least one of `rooms` and in none of `except`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOptions {
    #[serde(default)]
    pub rooms: HashSet<Room>,
    #[serde(default)]
    pub except: HashSet<Room>,
    #[serde(default)]
    pub flags: BroadcastFlags,
}

impl BroadcastOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn to_rooms<I, R>(rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        Self {
            rooms: rooms.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn except<I, R>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Room>,
    {
        self.except.extend(rooms.into_iter().map(Into::into));
        self
    }

    pub fn local(mut self) -> Self {
        self.flags.local = true;
        self
    }

    pub fn with_ack(mut self) -> Self {
        self.flags.expect_ack = true;
        self
    }

    /// Whether a socket with the given room memberships is targeted.
    pub fn matches(&self, socket_rooms: &HashSet<Room>) -> bool {
        let included = self.rooms.is_empty() || self.rooms.iter().any(|r| socket_rooms.contains(r));
        included && !self.except.iter().any(|r| socket_rooms.contains(r))
    }
}

/// Serializable description of a socket, as returned by `fetch_sockets`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketDetails {
    pub id: SocketId,
    pub rooms: BTreeSet<Room>,
    #[serde(default)]
    pub data: Value,
}
