// Fakes shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use ferry::bus::Publisher;
use ferry::error::{FerryError, Result};
use ferry::listener::{Callback, Delivery};
use ferry::message::{Message, MessageType, REQUEST_ADDRESS_KEY};
use ferry::transfer::{Fetcher, RequestClient, RequestTimeouts, TransferReply, TransferRequest};
use serde_json::Map;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{watch, Notify};

pub fn push(uid: &str) -> Message {
    Message::with_uid("/hrpt/l0", MessageType::Push, uid).with_field(REQUEST_ADDRESS_KEY, "127.0.0.1:0")
}

pub fn message(kind: MessageType, uid: &str) -> Message {
    Message::with_uid("/hrpt/l0", kind, uid)
}

/// Request client that counts outbound requests and answers from a script.
pub struct FakeOwner {
    requests: Mutex<Vec<TransferRequest>>,
    refuse: Option<String>,
}

impl FakeOwner {
    pub fn granting() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            refuse: None,
        }
    }

    pub fn refusing(reason: &str) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            refuse: Some(reason.to_string()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestClient for FakeOwner {
    async fn request(
        &self,
        _address: &str,
        request: &TransferRequest,
        _timeouts: RequestTimeouts,
    ) -> Result<TransferReply> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(match &self.refuse {
            Some(reason) => TransferReply::Refused {
                reason: reason.clone(),
            },
            None => {
                let mut data = Map::new();
                data.insert("origin".to_string(), "owner".into());
                TransferReply::Granted {
                    uri: format!("file:///outgoing/{}", request.uid),
                    data,
                }
            }
        })
    }
}

/// Fetcher that reports success without touching disk, optionally holding
/// each fetch until released or forever.
pub struct FakeFetcher {
    mode: FetchMode,
    fetches: AtomicUsize,
    gate: Notify,
}

enum FetchMode {
    Immediate,
    Gated,
    Hang,
}

impl FakeFetcher {
    pub fn immediate() -> Self {
        Self::with_mode(FetchMode::Immediate)
    }

    /// Each fetch waits for one [`FakeFetcher::release`].
    pub fn gated() -> Self {
        Self::with_mode(FetchMode::Gated)
    }

    pub fn hanging() -> Self {
        Self::with_mode(FetchMode::Hang)
    }

    fn with_mode(mode: FetchMode) -> Self {
        Self {
            mode,
            fetches: AtomicUsize::new(0),
            gate: Notify::new(),
        }
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, uri: &str, destination: &Path, _login: Option<&str>) -> Result<PathBuf> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            FetchMode::Immediate => {}
            FetchMode::Gated => self.gate.notified().await,
            FetchMode::Hang => std::future::pending::<()>().await,
        }
        let name = uri.rsplit('/').next().unwrap_or("unnamed");
        Ok(destination.join(name))
    }
}

/// Callback that records every delivery it sees.
pub struct Recorder {
    seen: Mutex<Vec<(MessageType, String, bool)>>,
    count: watch::Sender<usize>,
    outcome: Outcome,
}

enum Outcome {
    Continue,
    BreakOn(MessageType),
    FailOn(MessageType),
}

impl Recorder {
    pub fn new() -> Self {
        Self::with_outcome(Outcome::Continue)
    }

    pub fn breaking_on(kind: MessageType) -> Self {
        Self::with_outcome(Outcome::BreakOn(kind))
    }

    pub fn failing_on(kind: MessageType) -> Self {
        Self::with_outcome(Outcome::FailOn(kind))
    }

    fn with_outcome(outcome: Outcome) -> Self {
        let (count, _) = watch::channel(0);
        Self {
            seen: Mutex::new(Vec::new()),
            count,
            outcome,
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Types seen, in order.
    pub fn kinds(&self) -> Vec<MessageType> {
        self.seen.lock().unwrap().iter().map(|(k, _, _)| *k).collect()
    }

    /// Whether each delivery was the driver of its uid, in order.
    pub fn drivers(&self) -> Vec<bool> {
        self.seen.lock().unwrap().iter().map(|(_, _, d)| *d).collect()
    }

    pub async fn wait_for(&self, count: usize) {
        let mut rx = self.count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

#[async_trait]
impl Callback for Recorder {
    async fn call(&self, delivery: Delivery) -> anyhow::Result<ControlFlow<()>> {
        let kind = delivery.message().kind;
        let uid = delivery.message().uid().unwrap_or_default().to_string();
        self.seen
            .lock()
            .unwrap()
            .push((kind, uid, delivery.is_driver()));
        self.count.send_modify(|n| *n += 1);

        match self.outcome {
            Outcome::BreakOn(k) if k == kind => Ok(ControlFlow::Break(())),
            Outcome::FailOn(k) if k == kind => anyhow::bail!("handler rejected {}", kind),
            _ => Ok(ControlFlow::Continue(())),
        }
    }
}

/// Publisher that records everything and rejects one message kind.
pub struct RejectingPublisher {
    reject: MessageType,
    published: Mutex<Vec<Message>>,
}

impl RejectingPublisher {
    pub fn rejecting(kind: MessageType) -> Self {
        Self {
            reject: kind,
            published: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, kind: MessageType) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind == kind)
            .count()
    }
}

#[async_trait]
impl Publisher for RejectingPublisher {
    async fn publish(&self, message: Message) -> Result<()> {
        if message.kind == self.reject {
            return Err(FerryError::SubscriptionClosed {
                address: "publisher".to_string(),
            });
        }
        self.published.lock().unwrap().push(message);
        Ok(())
    }
}

/// Yield until `condition` holds.
pub async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}
