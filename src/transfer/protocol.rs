//! Transfer protocol: request -> fetch -> publish -> cache update for one uid.
//!
//! Both registries gate every step. A uid already in the completed cache is
//! acknowledged without a fetch; a uid already in flight is queued behind
//! its driver. Only the driver talks to the file owner.

use crate::bus::Publisher;
use crate::error::{FerryError, Result};
use crate::listener::Delivery;
use crate::message::{Message, MessageType, REQUEST_ADDRESS_KEY, URI_KEY};
use crate::registry::{Registries, TransferGuard};
use crate::transfer::fetch::Fetcher;
use crate::transfer::request::{RequestClient, RequestTimeouts, TransferReply, TransferRequest};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// How long `terminate` waits for cancelled transfers to unwind
pub const TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    pub destination: PathBuf,
    pub login: Option<String>,
    /// Owner address used when a push carries no `request_address`
    pub default_request_address: Option<String>,
    pub request_timeout: Duration,
    pub transfer_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Already fetched; an ack was published instead.
    Acknowledged,
    /// Another driver owns the uid; this request waits on it.
    Queued,
    /// Fetched to the given local path.
    Fetched(PathBuf),
}

pub struct TransferProtocol {
    registries: Registries,
    requester: Arc<dyn RequestClient>,
    fetcher: Arc<dyn Fetcher>,
    publisher: Arc<dyn Publisher>,
    settings: TransferSettings,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TransferProtocol {
    pub fn new(
        registries: Registries,
        requester: Arc<dyn RequestClient>,
        fetcher: Arc<dyn Fetcher>,
        publisher: Arc<dyn Publisher>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            registries,
            requester,
            fetcher,
            publisher,
            settings,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn registries(&self) -> &Registries {
        &self.registries
    }

    /// Number of spawned transfers still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Handle one `push` end to end.
    pub async fn request_push(&self, message: &Message) -> Result<PushOutcome> {
        let uid = require_uid(message)?;
        if self.registries.completed.contains(uid) {
            self.send_ack(message).await?;
            return Ok(PushOutcome::Acknowledged);
        }

        match self.registries.ongoing.add_if_absent(uid, message.clone()) {
            Some(guard) => self.drive(guard, message).await,
            None => {
                debug!(%uid, "Transfer already in flight, request queued");
                Ok(PushOutcome::Queued)
            }
        }
    }

    /// Handle a `push` the listener already registered.
    ///
    /// The delivery carries the driver guard when the listener's
    /// registration made it the driver.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<PushOutcome> {
        let (message, driver) = delivery.into_parts();
        let uid = require_uid(&message)?;
        match driver {
            Some(guard) => self.drive(guard, &message).await,
            None if self.registries.completed.contains(uid) => {
                self.send_ack(&message).await?;
                Ok(PushOutcome::Acknowledged)
            }
            None => {
                debug!(%uid, "Transfer already in flight, request queued");
                Ok(PushOutcome::Queued)
            }
        }
    }

    /// Run [`handle_delivery`](Self::handle_delivery) on a tracked task so the
    /// listener keeps receiving while the fetch runs.
    pub fn spawn_delivery(self: &Arc<Self>, delivery: Delivery) {
        if self.cancel.is_cancelled() {
            debug!(uid = ?delivery.message().uid(), "Transfers terminated, dropping push");
            return;
        }
        let protocol = Arc::clone(self);
        self.tasks.spawn(async move {
            let uid = delivery.message().uid().map(str::to_string);
            match protocol.handle_delivery(delivery).await {
                Ok(_) => {}
                Err(FerryError::Cancelled { .. }) => debug!(?uid, "Transfer cancelled"),
                Err(e) => warn!(?uid, error = %e, "Transfer failed"),
            }
        });
    }

    async fn drive(&self, guard: TransferGuard, message: &Message) -> Result<PushOutcome> {
        let uid = guard.uid().to_string();
        // Another driver may have finished between the cache check and
        // our registration.
        if self.registries.completed.contains(&uid) {
            let requests = guard.complete();
            self.ack_all(&requests).await?;
            return Ok(PushOutcome::Acknowledged);
        }

        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(FerryError::Cancelled { uid: uid.clone() }),
            result = self.fetch(&uid, message) => result,
        };

        match result {
            Ok((path, grant_data)) => {
                self.registries.completed.add(&uid);
                let requests = guard.complete();
                info!(%uid, path = %path.display(), "Transfer complete");

                let published = self.publish_result(message, grant_data, &path).await;
                let acked = self.ack_all(requests.get(1..).unwrap_or_default()).await;
                published?;
                acked?;
                Ok(PushOutcome::Fetched(path))
            }
            Err(e) => {
                drop(guard);
                debug!(%uid, error = %e, "Released for retry");
                Err(e)
            }
        }
    }

    async fn fetch(
        &self,
        uid: &str,
        message: &Message,
    ) -> Result<(PathBuf, serde_json::Map<String, Value>)> {
        let address = message
            .request_address()
            .or(self.settings.default_request_address.as_deref())
            .ok_or_else(|| FerryError::NoRequestAddress {
                uid: uid.to_string(),
            })?;

        let request = TransferRequest::new(uid, message, &self.settings.destination);
        let timeouts = RequestTimeouts {
            request: self.settings.request_timeout,
            transfer: self.settings.transfer_timeout,
        };
        debug!(%uid, %address, "Requesting transfer");

        match self.requester.request(address, &request, timeouts).await? {
            TransferReply::Granted { uri, data } => {
                let path = self
                    .fetcher
                    .fetch(&uri, &self.settings.destination, self.settings.login.as_deref())
                    .await?;
                Ok((path, data))
            }
            TransferReply::Refused { reason } => Err(FerryError::Refused {
                uid: uid.to_string(),
                address: address.to_string(),
                reason,
            }),
        }
    }

    async fn send_ack(&self, message: &Message) -> Result<()> {
        debug!(uid = ?message.uid(), "Already transferred, acknowledging");
        self.publisher.publish(message.reply(MessageType::Ack)).await
    }

    /// Ack every request, carrying on past failures. Returns the first error.
    async fn ack_all(&self, requests: &[Message]) -> Result<()> {
        let mut first = Ok(());
        for request in requests {
            if let Err(e) = self.send_ack(request).await {
                warn!(uid = ?request.uid(), error = %e, "Failed to acknowledge request");
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }

    async fn publish_result(
        &self,
        message: &Message,
        grant_data: serde_json::Map<String, Value>,
        path: &Path,
    ) -> Result<()> {
        let mut result = message.reply(MessageType::File);
        result.data.extend(grant_data);
        result.data.remove(REQUEST_ADDRESS_KEY);
        result.data.insert(
            URI_KEY.to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        );
        self.publisher.publish(result).await
    }

    /// Cancel every in-flight transfer and wait for them to unwind.
    ///
    /// Registry entries are released by the drivers' guards as they unwind.
    pub async fn terminate(&self) {
        self.begin_terminate();
        self.wait_terminated().await;
    }

    fn begin_terminate(&self) {
        self.cancel.cancel();
        self.tasks.close();
    }

    async fn wait_terminated(&self) {
        if tokio::time::timeout(TERMINATE_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "Transfers still running after terminate timeout"
            );
        }
    }
}

/// Cancel in-flight transfers across all given protocols. Every protocol is
/// cancelled before any is waited on.
pub async fn terminate_transfers<'a, I>(protocols: I)
where
    I: IntoIterator<Item = &'a TransferProtocol>,
{
    let protocols: Vec<&TransferProtocol> = protocols.into_iter().collect();
    for protocol in &protocols {
        protocol.begin_terminate();
    }
    for protocol in &protocols {
        protocol.wait_terminated().await;
    }
}

fn require_uid(message: &Message) -> Result<&str> {
    message.uid().ok_or_else(|| {
        FerryError::MalformedMessage(format!("{} message on {} has no uid", message.kind, message.topic))
    })
}
