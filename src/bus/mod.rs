//! Publish/subscribe bus seam.
//!
//! The listener and transfer protocol only see these traits. Two
//! implementations ship with the crate: a framed TCP bus and an in-process
//! bus.

use crate::error::Result;
use crate::message::Message;
use async_trait::async_trait;
use std::sync::Arc;

pub mod memory;
pub mod tcp;
pub mod wire;

pub use memory::MemoryBus;
pub use tcp::{TcpConnector, TcpPublisher, TcpSubscriber};

/// An open subscription.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Wait for the next message.
    ///
    /// `Ok(None)` is an empty receive (nothing usable arrived) and is looped
    /// past by callers. Implementations must be cancel-safe: the listener
    /// races this future against timers.
    async fn recv(&self) -> Result<Option<Message>>;

    /// Close the subscription. Pending and later `recv` calls fail.
    fn close(&self);
}

/// Opens subscriptions to a bus address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn subscribe(&self, address: &str, topics: &[String]) -> Result<Arc<dyn Subscriber>>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: Message) -> Result<()>;
}

/// Whether `topic` falls under the subscription `prefix`.
///
/// Matching is by path segment: `/hrpt` matches `/hrpt` and `/hrpt/l0` but
/// not `/hrpt2`. An empty prefix matches everything.
pub fn topic_matches(prefix: &str, topic: &str) -> bool {
    if prefix.is_empty() || prefix == "/" {
        return true;
    }
    match topic.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

/// Whether `topic` matches any of `prefixes`.
pub fn matches_any(prefixes: &[String], topic: &str) -> bool {
    prefixes.iter().any(|prefix| topic_matches(prefix, topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches_by_segment() {
        assert!(topic_matches("/hrpt", "/hrpt"));
        assert!(topic_matches("/hrpt", "/hrpt/l0"));
        assert!(topic_matches("/hrpt/", "/hrpt/l0"));
        assert!(!topic_matches("/hrpt", "/hrpt2"));
        assert!(!topic_matches("/hrpt/l0", "/hrpt"));
        assert!(topic_matches("", "/anything"));
    }

    #[test]
    fn test_matches_any() {
        let prefixes = vec!["/a".to_string(), "/b/c".to_string()];
        assert!(matches_any(&prefixes, "/a/x"));
        assert!(matches_any(&prefixes, "/b/c"));
        assert!(!matches_any(&prefixes, "/b"));
        assert!(!matches_any(&[], "/a"));
    }
}
