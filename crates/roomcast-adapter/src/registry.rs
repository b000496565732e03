//! Per-node room registry: the sockets connected to this process.
//!
//! The adapter only ever sees its own node's sockets through
//! [`LocalRegistry`]; cluster-wide views are assembled from peer responses.

use std::collections::HashSet;

use dashmap::DashMap;
use roomcast_core::{BroadcastOptions, Packet, Room, SocketDetails, SocketId};
use serde_json::Value;
use tokio::sync::mpsc;

/// Local operations the adapter performs on behalf of itself or a peer.
pub trait LocalRegistry: Send + Sync + 'static {
    fn matching_sockets(&self, opts: &BroadcastOptions) -> HashSet<SocketId>;

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<SocketDetails>;

    fn all_rooms(&self) -> HashSet<Room>;

    /// Returns `false` when the socket is not connected to this node.
    fn join(&self, id: &SocketId, room: &Room) -> bool;

    fn leave(&self, id: &SocketId, room: &Room) -> bool;

    fn disconnect(&self, id: &SocketId, close: bool) -> bool;

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]);

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]);

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool);

    /// Deliver to matching sockets. Returns how many received it.
    fn deliver(&self, packet: &Packet, opts: &BroadcastOptions) -> usize;

    /// Deliver to matching sockets, each with a one-shot ack that reports on
    /// `acks`. Returns how many clients were handed the packet, i.e. how many
    /// acks to expect at most.
    fn deliver_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        acks: mpsc::UnboundedSender<Value>,
    ) -> usize;
}

/// Handle a client uses to acknowledge one delivered packet.
#[derive(Debug)]
pub struct AckSender(mpsc::UnboundedSender<Value>);

impl AckSender {
    pub fn send(self, value: Value) {
        let _ = self.0.send(value);
    }
}

/// What a connected client receives from its node.
#[derive(Debug)]
pub enum ClientMessage {
    Event {
        packet: Packet,
        ack: Option<AckSender>,
    },
    Disconnect {
        close: bool,
    },
}

struct LocalSocket {
    rooms: HashSet<Room>,
    data: Value,
    tx: mpsc::Sender<ClientMessage>,
}

impl LocalSocket {
    fn details(&self, id: &SocketId) -> SocketDetails {
        SocketDetails {
            id: id.clone(),
            rooms: self.rooms.iter().cloned().collect(),
            data: self.data.clone(),
        }
    }

    fn send(&self, id: &SocketId, message: ClientMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(socket_id = %id, "client queue full, dropping packet");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// In-memory [`LocalRegistry`] backed by per-client channels.
pub struct MemoryRegistry {
    sockets: DashMap<SocketId, LocalSocket>,
    max_send_queue: usize,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MemoryRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            sockets: DashMap::new(),
            max_send_queue,
        }
    }

    /// Connect a new client. It starts in the room named after its own id.
    pub fn connect(&self, data: Value) -> (SocketId, mpsc::Receiver<ClientMessage>) {
        let id = SocketId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let socket = LocalSocket {
            rooms: HashSet::from([Room::from(&id)]),
            data,
            tx,
        };
        let _ = self.sockets.insert(id.clone(), socket);
        (id, rx)
    }

    pub fn has_socket(&self, id: &SocketId) -> bool {
        self.sockets.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.sockets.len()
    }

    pub fn rooms_of(&self, id: &SocketId) -> Option<HashSet<Room>> {
        self.sockets.get(id).map(|s| s.rooms.clone())
    }

    fn matching_ids(&self, opts: &BroadcastOptions) -> Vec<SocketId> {
        self.sockets
            .iter()
            .filter(|entry| opts.matches(&entry.value().rooms))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl LocalRegistry for MemoryRegistry {
    fn matching_sockets(&self, opts: &BroadcastOptions) -> HashSet<SocketId> {
        self.matching_ids(opts).into_iter().collect()
    }

    fn fetch_sockets(&self, opts: &BroadcastOptions) -> Vec<SocketDetails> {
        self.sockets
            .iter()
            .filter(|entry| opts.matches(&entry.value().rooms))
            .map(|entry| entry.value().details(entry.key()))
            .collect()
    }

    fn all_rooms(&self) -> HashSet<Room> {
        self.sockets
            .iter()
            .flat_map(|entry| entry.value().rooms.iter().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn join(&self, id: &SocketId, room: &Room) -> bool {
        match self.sockets.get_mut(id) {
            Some(mut socket) => {
                let _ = socket.rooms.insert(room.clone());
                true
            }
            None => false,
        }
    }

    fn leave(&self, id: &SocketId, room: &Room) -> bool {
        match self.sockets.get_mut(id) {
            Some(mut socket) => {
                let _ = socket.rooms.remove(room);
                true
            }
            None => false,
        }
    }

    fn disconnect(&self, id: &SocketId, close: bool) -> bool {
        match self.sockets.remove(id) {
            Some((id, socket)) => {
                let _ = socket.send(&id, ClientMessage::Disconnect { close });
                tracing::debug!(socket_id = %id, close, "socket disconnected");
                true
            }
            None => false,
        }
    }

    fn add_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]) {
        for id in self.matching_ids(opts) {
            if let Some(mut socket) = self.sockets.get_mut(&id) {
                socket.rooms.extend(rooms.iter().cloned());
            }
        }
    }

    fn del_sockets(&self, opts: &BroadcastOptions, rooms: &[Room]) {
        for id in self.matching_ids(opts) {
            if let Some(mut socket) = self.sockets.get_mut(&id) {
                for room in rooms {
                    let _ = socket.rooms.remove(room);
                }
            }
        }
    }

    fn disconnect_sockets(&self, opts: &BroadcastOptions, close: bool) {
        for id in self.matching_ids(opts) {
            let _ = self.disconnect(&id, close);
        }
    }

    fn deliver(&self, packet: &Packet, opts: &BroadcastOptions) -> usize {
        self.sockets
            .iter()
            .filter(|entry| opts.matches(&entry.value().rooms))
            .filter(|entry| {
                entry.value().send(
                    entry.key(),
                    ClientMessage::Event {
                        packet: packet.clone(),
                        ack: None,
                    },
                )
            })
            .count()
    }

    fn deliver_with_ack(
        &self,
        packet: &Packet,
        opts: &BroadcastOptions,
        acks: mpsc::UnboundedSender<Value>,
    ) -> usize {
        self.sockets
            .iter()
            .filter(|entry| opts.matches(&entry.value().rooms))
            .filter(|entry| {
                entry.value().send(
                    entry.key(),
                    ClientMessage::Event {
                        packet: packet.clone(),
                        ack: Some(AckSender(acks.clone())),
                    },
                )
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn packet() -> Packet {
        Packet::new("msg", vec![json!("hi")])
    }

    #[test]
    fn connect_joins_own_room() {
        let registry = MemoryRegistry::default();
        let (id, _rx) = registry.connect(json!({}));
        assert_eq!(registry.count(), 1);
        assert!(registry.rooms_of(&id).unwrap().contains(&Room::from(&id)));
    }

    #[test]
    fn join_leave_unknown_socket() {
        let registry = MemoryRegistry::default();
        let ghost = SocketId::new();
        assert!(!registry.join(&ghost, &Room::from("r")));
        assert!(!registry.leave(&ghost, &Room::from("r")));
        assert!(!registry.disconnect(&ghost, true));
    }

    #[test]
    fn matching_respects_rooms_and_except() {
        let registry = MemoryRegistry::default();
        let (a, _ra) = registry.connect(json!({}));
        let (b, _rb) = registry.connect(json!({}));
        let (_c, _rc) = registry.connect(json!({}));
        let _ = registry.join(&a, &Room::from("r1"));
        let _ = registry.join(&b, &Room::from("r1"));

        let in_r1 = registry.matching_sockets(&BroadcastOptions::to_rooms(["r1"]));
        assert_eq!(in_r1, HashSet::from([a.clone(), b.clone()]));

        let except_b = BroadcastOptions::to_rooms(["r1"]).except([Room::from(&b)]);
        assert_eq!(registry.matching_sockets(&except_b), HashSet::from([a]));

        assert_eq!(registry.matching_sockets(&BroadcastOptions::all()).len(), 3);
    }

    #[tokio::test]
    async fn deliver_sends_to_matching_clients_only() {
        let registry = MemoryRegistry::default();
        let (a, mut ra) = registry.connect(json!({}));
        let (_b, mut rb) = registry.connect(json!({}));
        let _ = registry.join(&a, &Room::from("r1"));

        let n = registry.deliver(&packet(), &BroadcastOptions::to_rooms(["r1"]));
        assert_eq!(n, 1);
        assert!(matches!(ra.recv().await, Some(ClientMessage::Event { ack: None, .. })));
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn deliver_with_ack_hands_out_ack_senders() {
        let registry = MemoryRegistry::default();
        let (_a, mut ra) = registry.connect(json!({}));
        let (_b, mut rb) = registry.connect(json!({}));
        let (tx, mut acks) = mpsc::unbounded_channel();

        let n = registry.deliver_with_ack(&packet(), &BroadcastOptions::all(), tx);
        assert_eq!(n, 2);

        for rx in [&mut ra, &mut rb] {
            match rx.recv().await {
                Some(ClientMessage::Event { ack: Some(ack), .. }) => ack.send(json!("ok")),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(acks.recv().await, Some(json!("ok")));
        assert_eq!(acks.recv().await, Some(json!("ok")));
    }

    #[test]
    fn add_and_del_sockets_apply_to_matches() {
        let registry = MemoryRegistry::default();
        let (a, _ra) = registry.connect(json!({}));
        let (b, _rb) = registry.connect(json!({}));
        let _ = registry.join(&a, &Room::from("src"));

        registry.add_sockets(&BroadcastOptions::to_rooms(["src"]), &[Room::from("dst")]);
        assert!(registry.rooms_of(&a).unwrap().contains(&Room::from("dst")));
        assert!(!registry.rooms_of(&b).unwrap().contains(&Room::from("dst")));

        registry.del_sockets(&BroadcastOptions::all(), &[Room::from("dst"), Room::from("src")]);
        assert_eq!(registry.rooms_of(&a).unwrap(), HashSet::from([Room::from(&a)]));
    }

    #[tokio::test]
    async fn disconnect_sockets_notifies_and_removes() {
        let registry = MemoryRegistry::default();
        let (a, mut ra) = registry.connect(json!({}));
        let (_b, _rb) = registry.connect(json!({}));
        let _ = registry.join(&a, &Room::from("kick"));

        registry.disconnect_sockets(&BroadcastOptions::to_rooms(["kick"]), true);
        assert_eq!(registry.count(), 1);
        assert!(matches!(ra.recv().await, Some(ClientMessage::Disconnect { close: true })));
    }

    #[test]
    fn fetch_sockets_includes_data_and_rooms() {
        let registry = MemoryRegistry::default();
        let (a, _ra) = registry.connect(json!({"user": "ada"}));
        let _ = registry.join(&a, &Room::from("r1"));

        let details = registry.fetch_sockets(&BroadcastOptions::to_rooms(["r1"]));
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].id, a);
        assert_eq!(details[0].data["user"], "ada");
        assert!(details[0].rooms.contains(&Room::from("r1")));
    }

    #[test]
    fn all_rooms_is_union() {
        let registry = MemoryRegistry::default();
        let (a, _ra) = registry.connect(json!({}));
        let (b, _rb) = registry.connect(json!({}));
        let _ = registry.join(&a, &Room::from("x"));
        let _ = registry.join(&b, &Room::from("x"));
        let _ = registry.join(&b, &Room::from("y"));

        let rooms = registry.all_rooms();
        assert!(rooms.contains(&Room::from("x")));
        assert!(rooms.contains(&Room::from("y")));
        assert_eq!(rooms.len(), 4); // x, y and the two own-id rooms
    }
}
