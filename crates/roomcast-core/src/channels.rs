//! Pub/sub channel names for one namespace.
//!
//! Every node of a namespace publishes plain broadcasts on the broadcast
//! channel and distributed queries on the request channel. Responses go either
//! to the shared request channel or, when per-node responses are enabled, to a
//! channel embedding the requesting node's id so only the requester receives
//! them.

use crate::ids::NodeId;

/// The set of channels a node subscribes to and publishes on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Channels {
    pub broadcast: String,
    pub request: String,
    pub response: String,
    key_prefix: String,
    namespace: String,
    per_node: bool,
}

impl Channels {
    pub fn new(key_prefix: &str, namespace: &str, node_id: &NodeId, per_node: bool) -> Self {
        let request = format!("{key_prefix}-request#{namespace}#");
        let response = if per_node {
            format!("{request}{node_id}#")
        } else {
            request.clone()
        };
        Self {
            broadcast: format!("{key_prefix}#{namespace}#"),
            request,
            response,
            key_prefix: key_prefix.to_owned(),
            namespace: namespace.to_owned(),
            per_node,
        }
    }

    /// Channel a response to `requester` must be published on.
    pub fn response_for(&self, requester: &NodeId) -> String {
        if self.per_node {
            format!("{}-request#{}#{requester}#", self.key_prefix, self.namespace)
        } else {
            self.request.clone()
        }
    }

    /// Channels to subscribe to, without duplicates.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut channels = vec![self.broadcast.clone(), self.request.clone()];
        if self.response != self.request {
            channels.push(self.response.clone());
        }
        channels
    }

    pub fn per_node(&self) -> bool {
        self.per_node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_mode_names() {
        let node = NodeId::from_raw("n1");
        let ch = Channels::new("socket.io", "/", &node, false);
        assert_eq!(ch.broadcast, "socket.io#/#");
        assert_eq!(ch.request, "socket.io-request#/#");
        assert_eq!(ch.response, "socket.io-request#/#");
    }

    #[test]
    fn per_node_mode_embeds_node_id() {
        let node = NodeId::from_raw("n1");
        let ch = Channels::new("socket.io", "/chat", &node, true);
        assert_eq!(ch.response, "socket.io-request#/chat#n1#");
        assert_eq!(ch.request, "socket.io-request#/chat#");
    }

    #[test]
    fn response_for_targets_requester() {
        let me = NodeId::from_raw("me");
        let other = NodeId::from_raw("other");

        let shared = Channels::new("app", "/", &me, false);
        assert_eq!(shared.response_for(&other), "app-request#/#");

        let per_node = Channels::new("app", "/", &me, true);
        assert_eq!(per_node.response_for(&other), "app-request#/#other#");
        assert_eq!(per_node.response_for(&me), per_node.response);
    }

    #[test]
    fn subscriptions_skip_duplicate_response_channel() {
        let node = NodeId::from_raw("n1");
        assert_eq!(Channels::new("k", "/", &node, false).subscriptions().len(), 2);
        assert_eq!(Channels::new("k", "/", &node, true).subscriptions().len(), 3);
    }

    #[test]
    fn naming_is_deterministic() {
        let node = NodeId::from_raw("n1");
        assert_eq!(
            Channels::new("k", "/", &node, true),
            Channels::new("k", "/", &node, true)
        );
    }
}
