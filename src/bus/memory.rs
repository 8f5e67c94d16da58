//! In-process bus.
//!
//! Messages are injected per provider address with [`MemoryBus::deliver`];
//! everything published is recorded rather than looped back, so a chain
//! never consumes its own announcements.

use crate::bus::{matches_any, Connector, Publisher, Subscriber};
use crate::error::{FerryError, Result};
use crate::message::Message;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

struct Registration {
    address: String,
    topics: Vec<String>,
    tx: mpsc::UnboundedSender<Option<Message>>,
}

struct Inner {
    subscriptions: Mutex<Vec<Registration>>,
    published: Mutex<Vec<Message>>,
    published_count: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (published_count, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                published_count,
            }),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, Vec<Registration>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver `message` to every open subscription on `address` whose
    /// topics match. Returns the number of subscriptions reached.
    pub fn deliver(&self, address: &str, message: Message) -> usize {
        let mut subscriptions = self.subscriptions();
        subscriptions.retain(|sub| !sub.tx.is_closed());
        subscriptions
            .iter()
            .filter(|sub| sub.address == address && matches_any(&sub.topics, &message.topic))
            .filter(|sub| sub.tx.send(Some(message.clone())).is_ok())
            .count()
    }

    /// Deliver an empty receive to every subscription on `address`.
    pub fn deliver_empty(&self, address: &str) -> usize {
        self.subscriptions()
            .iter()
            .filter(|sub| sub.address == address)
            .filter(|sub| sub.tx.send(None).is_ok())
            .count()
    }

    /// Drop every subscription on `address` as if the provider went away.
    /// Pending and later receives on them fail.
    pub fn disconnect(&self, address: &str) -> usize {
        let mut subscriptions = self.subscriptions();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.address != address);
        before - subscriptions.len()
    }

    /// Number of open subscriptions on `address`.
    pub fn subscriber_count(&self, address: &str) -> usize {
        self.subscriptions()
            .iter()
            .filter(|sub| sub.address == address && !sub.tx.is_closed())
            .count()
    }

    /// Everything published so far, oldest first.
    pub fn published(&self) -> Vec<Message> {
        self.inner
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until at least `count` messages have been published.
    pub async fn wait_for_published(&self, count: usize) {
        let mut published = self.inner.published_count.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = published.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl Connector for MemoryBus {
    async fn subscribe(&self, address: &str, topics: &[String]) -> Result<Arc<dyn Subscriber>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions().push(Registration {
            address: address.to_string(),
            topics: topics.to_vec(),
            tx,
        });
        Ok(Arc::new(MemorySubscriber {
            address: address.to_string(),
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }))
    }
}

#[async_trait]
impl Publisher for MemoryBus {
    async fn publish(&self, message: Message) -> Result<()> {
        let count = {
            let mut published = self
                .inner
                .published
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            published.push(message);
            published.len()
        };
        self.inner.published_count.send_replace(count);
        Ok(())
    }
}

pub struct MemorySubscriber {
    address: String,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Option<Message>>>,
    closed: CancellationToken,
}

impl MemorySubscriber {
    fn closed_error(&self) -> FerryError {
        FerryError::SubscriptionClosed {
            address: self.address.clone(),
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn recv(&self) -> Result<Option<Message>> {
        if self.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(self.closed_error()),
            item = rx.recv() => item.ok_or_else(|| self.closed_error()),
        }
    }

    fn close(&self) {
        self.closed.cancel();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[tokio::test]
    async fn test_deliver_by_address_and_topic() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("a:1", &["/topic".to_string()]).await.unwrap();
        let _other = bus.subscribe("b:1", &["/topic".to_string()]).await.unwrap();

        let reached = bus.deliver("a:1", Message::with_uid("/topic", MessageType::Push, "f1"));
        assert_eq!(reached, 1);
        assert_eq!(bus.deliver("a:1", Message::with_uid("/other", MessageType::Push, "f2")), 0);

        let received = sub.recv().await.unwrap().unwrap();
        assert_eq!(received.uid(), Some("f1"));
    }

    #[tokio::test]
    async fn test_empty_receive() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("a:1", &["/topic".to_string()]).await.unwrap();

        bus.deliver_empty("a:1");
        assert!(sub.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_published_is_recorded_not_delivered() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("a:1", &["/topic".to_string()]).await.unwrap();

        bus.publish(Message::with_uid("/topic", MessageType::Ack, "f1"))
            .await
            .unwrap();
        bus.wait_for_published(1).await;

        assert_eq!(bus.published().len(), 1);
        sub.close();
        assert!(sub.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_subscription_is_pruned() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("a:1", &["/topic".to_string()]).await.unwrap();
        assert_eq!(bus.subscriber_count("a:1"), 1);

        sub.close();
        assert_eq!(bus.subscriber_count("a:1"), 0);
        assert_eq!(bus.deliver("a:1", Message::with_uid("/topic", MessageType::Push, "f")), 0);
    }
}
