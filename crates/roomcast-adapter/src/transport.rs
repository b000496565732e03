//! Pub/sub transport contract and an in-process implementation.
//!
//! The adapter needs three things from its transport: subscribe to a set of
//! channels, publish bytes on a channel, and (best effort) count the current
//! subscribers of a channel. Delivery is at-most-once and unordered; publish
//! is not acknowledged.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::errors::TransportError;

/// A message received on one of the subscribed channels.
#[derive(Clone, Debug)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Subscribe to `channels`. Messages from all of them arrive on the
    /// returned receiver; dropping it ends the subscription.
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<mpsc::Receiver<TransportMessage>, TransportError>;

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Number of subscriptions currently listening on `channel`, or `None`
    /// when the transport cannot tell.
    async fn subscriber_count(&self, channel: &str) -> Option<usize>;
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<TransportMessage>,
}

struct BusInner {
    channels: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    published: AtomicUsize,
    published_by_channel: DashMap<String, usize>,
    closed: AtomicBool,
}

/// In-process pub/sub bus shared by every node of a test or demo cluster.
///
/// Cloning is cheap; all clones talk to the same bus. A full subscriber queue
/// drops the message for that subscriber only.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBus {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: DashMap::new(),
                next_id: AtomicU64::new(0),
                queue_capacity,
                published: AtomicUsize::new(0),
                published_by_channel: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Total number of successful `publish` calls across all channels.
    pub fn publish_count(&self) -> usize {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn publish_count_on(&self, channel: &str) -> usize {
        self.inner
            .published_by_channel
            .get(channel)
            .map(|n| *n)
            .unwrap_or(0)
    }

    /// Make every subsequent subscribe/publish fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Relaxed);
        self.inner.channels.clear();
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Relaxed) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<mpsc::Receiver<TransportMessage>, TransportError> {
        self.ensure_open()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        for channel in channels {
            let mut subs = self.inner.channels.entry(channel.clone()).or_default();
            if !subs.iter().any(|s| s.id == id) {
                subs.push(Subscriber { id, tx: tx.clone() });
            }
        }
        tracing::debug!(subscription = id, channels = ?channels, "memory bus subscription");
        Ok(rx)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.ensure_open()?;
        let _ = self.inner.published.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .published_by_channel
            .entry(channel.to_owned())
            .or_insert(0) += 1;

        let Some(mut subs) = self.inner.channels.get_mut(channel) else {
            return Ok(());
        };
        subs.retain(|s| !s.tx.is_closed());
        for sub in subs.iter() {
            let message = TransportMessage {
                channel: channel.to_owned(),
                payload: payload.clone(),
            };
            match sub.tx.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        subscription = sub.id,
                        channel,
                        "subscriber queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        Ok(())
    }

    async fn subscriber_count(&self, channel: &str) -> Option<usize> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return None;
        }
        Some(
            self.inner
                .channels
                .get(channel)
                .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
                .unwrap_or(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chans(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let bus = MemoryBus::default();
        let mut a = bus.subscribe(&chans(&["c"])).await.unwrap();
        let mut b = bus.subscribe(&chans(&["c"])).await.unwrap();

        bus.publish("c", Bytes::from_static(b"hi")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().payload, Bytes::from_static(b"hi"));
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.channel, "c");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = MemoryBus::default();
        bus.publish("nobody", Bytes::new()).await.unwrap();
        assert_eq!(bus.publish_count(), 1);
        assert_eq!(bus.publish_count_on("nobody"), 1);
        assert_eq!(bus.publish_count_on("other"), 0);
    }

    #[tokio::test]
    async fn one_subscription_counts_once_per_channel() {
        let bus = MemoryBus::default();
        let _rx = bus.subscribe(&chans(&["a", "b", "a"])).await.unwrap();
        assert_eq!(bus.subscriber_count("a").await, Some(1));
        assert_eq!(bus.subscriber_count("b").await, Some(1));
        assert_eq!(bus.subscriber_count("c").await, Some(0));
    }

    #[tokio::test]
    async fn dropped_receiver_unsubscribes() {
        let bus = MemoryBus::default();
        let rx = bus.subscribe(&chans(&["c"])).await.unwrap();
        let _keep = bus.subscribe(&chans(&["c"])).await.unwrap();
        assert_eq!(bus.subscriber_count("c").await, Some(2));
        drop(rx);
        assert_eq!(bus.subscriber_count("c").await, Some(1));
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_subscriber_only() {
        let bus = MemoryBus::new(1);
        let mut slow = bus.subscribe(&chans(&["c"])).await.unwrap();

        bus.publish("c", Bytes::from_static(b"1")).await.unwrap();
        bus.publish("c", Bytes::from_static(b"2")).await.unwrap();

        assert_eq!(slow.recv().await.unwrap().payload, Bytes::from_static(b"1"));
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish() {
        let bus = MemoryBus::default();
        bus.close();
        assert!(matches!(
            bus.publish("c", Bytes::new()).await,
            Err(TransportError::Closed)
        ));
        assert!(bus.subscribe(&chans(&["c"])).await.is_err());
        assert_eq!(bus.subscriber_count("c").await, None);
    }
}
