//! Message listener.
//!
//! Owns one subscription, pulls messages in a loop and routes each one:
//!
//! | type   | action                                                    |
//! |--------|-----------------------------------------------------------|
//! | `push` | register in `OngoingTransfers`, invoke callback           |
//! | `ack`  | record uid in `CompletedCache`, invoke callback           |
//! | `file` | invoke callback                                           |
//! | `beat` | feed the heartbeat monitor only                           |
//!
//! With a non-zero processing delay the listener acts as a hot spare:
//! `push` and `file` callbacks are deferred by that delay, released early
//! when the provider goes silent, and dropped if the uid completes in the
//! meantime.

use crate::bus::{Connector, Subscriber};
use crate::error::{FerryError, Result};
use crate::heartbeat::{deadline, HeartbeatMonitor};
use crate::message::{Message, MessageType};
use crate::registry::{Registries, TransferGuard};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A message handed to the callback.
///
/// For a `push` that made this listener the driver of its uid, the delivery
/// also owns the registry entry; dropping the delivery releases it.
#[derive(Debug)]
pub struct Delivery {
    message: Message,
    driver: Option<TransferGuard>,
}

impl Delivery {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            driver: None,
        }
    }

    /// A delivery that owns the registry entry for its uid.
    pub fn with_driver(message: Message, driver: TransferGuard) -> Self {
        Self {
            message,
            driver: Some(driver),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_driver(&self) -> bool {
        self.driver.is_some()
    }

    pub fn into_parts(self) -> (Message, Option<TransferGuard>) {
        (self.message, self.driver)
    }
}

/// Handler invoked for `push`, `ack` and `file` messages.
///
/// Returning `ControlFlow::Break` ends the receive loop cleanly; an error
/// ends it with [`FerryError::Callback`].
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, delivery: Delivery) -> anyhow::Result<ControlFlow<()>>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListenerOptions {
    /// Hot-spare deferral for `push` and `file` messages
    pub processing_delay: Duration,
    /// Silence threshold for provider heartbeats; `None` disables monitoring
    pub heartbeat_timeout: Option<Duration>,
    /// Reopen the subscription when the provider goes silent
    pub resubscribe_on_silence: bool,
}

struct State {
    running: bool,
    subscriber: Option<Arc<dyn Subscriber>>,
    stop: CancellationToken,
    /// Bumped by every `run`; a run only tears down state it still owns.
    generation: u64,
}

struct Deferred {
    due: Instant,
    delivery: Delivery,
}

pub struct Listener {
    address: String,
    topics: Vec<String>,
    callback: Arc<dyn Callback>,
    options: ListenerOptions,
    connector: Arc<dyn Connector>,
    registries: Registries,
    state: Mutex<State>,
}

impl Listener {
    pub fn new(
        address: impl Into<String>,
        topics: Vec<String>,
        callback: Arc<dyn Callback>,
        options: ListenerOptions,
        connector: Arc<dyn Connector>,
        registries: Registries,
    ) -> Result<Self> {
        if topics.is_empty() {
            return Err(FerryError::Config(
                "listener needs at least one topic".to_string(),
            ));
        }
        Ok(Self {
            address: address.into(),
            topics,
            callback,
            options,
            connector,
            registries,
            state: Mutex::new(State {
                running: false,
                subscriber: None,
                stop: CancellationToken::new(),
                generation: 0,
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn is_running(&self) -> bool {
        self.state().running
    }

    /// Whether a subscription is currently held.
    pub fn has_subscriber(&self) -> bool {
        self.state().subscriber.is_some()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe and process messages until stopped, the callback breaks,
    /// or an error occurs. The subscription is released on every exit path.
    pub async fn run(&self) -> Result<()> {
        let (stop, generation) = {
            let mut state = self.state();
            if state.running {
                return Err(FerryError::AlreadyRunning {
                    address: self.address.clone(),
                });
            }
            state.running = true;
            state.generation += 1;
            state.stop = CancellationToken::new();
            (state.stop.clone(), state.generation)
        };

        let subscriber = match self.connector.subscribe(&self.address, &self.topics).await {
            Ok(subscriber) => subscriber,
            Err(e) => {
                self.finish(generation);
                return Err(e);
            }
        };
        {
            let mut state = self.state();
            if stop.is_cancelled() {
                drop(state);
                subscriber.close();
                return Ok(());
            }
            state.subscriber = Some(Arc::clone(&subscriber));
        }
        info!(address = %self.address, topics = ?self.topics, "Listener started");

        let monitor = HeartbeatMonitor::start(self.options.heartbeat_timeout);
        let result = self.receive(subscriber, &monitor, &stop).await;
        drop(monitor);

        self.finish(generation);
        result
    }

    /// Close the subscription and end the receive loop. Idempotent.
    pub fn stop(&self) {
        let was_running = {
            let state = self.state();
            state.stop.cancel();
            state.running
        };
        self.shutdown();
        if was_running {
            info!(address = %self.address, "Listener stopped");
        }
    }

    fn shutdown(&self) {
        let subscriber = {
            let mut state = self.state();
            state.running = false;
            state.subscriber.take()
        };
        if let Some(subscriber) = subscriber {
            subscriber.close();
        }
    }

    /// End-of-run cleanup. A no-op once `stop` has let a newer run start.
    fn finish(&self, generation: u64) {
        let subscriber = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.running = false;
            state.subscriber.take()
        };
        if let Some(subscriber) = subscriber {
            subscriber.close();
        }
    }

    async fn receive(
        &self,
        mut subscriber: Arc<dyn Subscriber>,
        monitor: &HeartbeatMonitor,
        stop: &CancellationToken,
    ) -> Result<()> {
        let mut deferred: VecDeque<Deferred> = VecDeque::new();
        let mut liveness = monitor.liveness();

        loop {
            let due = deferred.front().map(|d| d.due);
            let flow = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                _ = sleep_until(due) => self.release_due(&mut deferred).await?,
                changed = liveness.changed() => {
                    if changed.is_err() || *liveness.borrow_and_update() {
                        continue;
                    }
                    let flow = self.release_all(&mut deferred).await?;
                    if flow.is_continue() && self.options.resubscribe_on_silence {
                        subscriber = self.resubscribe(subscriber, stop).await?;
                    }
                    flow
                }
                received = subscriber.recv() => match received? {
                    Some(message) => self.dispatch(message, monitor, &mut deferred).await?,
                    None => continue,
                },
            };

            if flow.is_break() {
                debug!(address = %self.address, "Callback ended the receive loop");
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &self,
        message: Message,
        monitor: &HeartbeatMonitor,
        deferred: &mut VecDeque<Deferred>,
    ) -> Result<ControlFlow<()>> {
        monitor.feed(&message);
        match message.kind {
            MessageType::Beat => Ok(ControlFlow::Continue(())),
            MessageType::Ack => {
                if let Some(uid) = message.uid() {
                    self.registries.completed.add(uid);
                }
                self.invoke(Delivery::new(message)).await
            }
            MessageType::Push => {
                let driver = message
                    .uid()
                    .and_then(|uid| self.registries.ongoing.add_if_absent(uid, message.clone()));
                self.act_or_defer(Delivery { message, driver }, monitor, deferred)
                    .await
            }
            MessageType::File => {
                self.act_or_defer(Delivery::new(message), monitor, deferred)
                    .await
            }
        }
    }

    async fn act_or_defer(
        &self,
        delivery: Delivery,
        monitor: &HeartbeatMonitor,
        deferred: &mut VecDeque<Deferred>,
    ) -> Result<ControlFlow<()>> {
        let delay = self.options.processing_delay;
        if delay.is_zero() {
            return self.invoke(delivery).await;
        }
        if !monitor.is_alive() {
            debug!(address = %self.address, "Provider silent, acting without delay");
            return self.invoke(delivery).await;
        }

        deferred.push_back(Deferred {
            due: deadline(Instant::now(), delay),
            delivery,
        });
        Ok(ControlFlow::Continue(()))
    }

    async fn release_due(&self, deferred: &mut VecDeque<Deferred>) -> Result<ControlFlow<()>> {
        let now = Instant::now();
        while deferred.front().is_some_and(|d| d.due <= now) {
            let Some(item) = deferred.pop_front() else {
                break;
            };
            if self.release(item.delivery).await?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn release_all(&self, deferred: &mut VecDeque<Deferred>) -> Result<ControlFlow<()>> {
        if !deferred.is_empty() {
            debug!(address = %self.address, count = deferred.len(), "Releasing deferred messages");
        }
        while let Some(item) = deferred.pop_front() {
            if self.release(item.delivery).await?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    async fn release(&self, delivery: Delivery) -> Result<ControlFlow<()>> {
        if let Some(uid) = delivery.message().uid() {
            if self.registries.completed.contains(uid) {
                debug!(%uid, "Already handled by the primary, skipping");
                return Ok(ControlFlow::Continue(()));
            }
        }
        self.invoke(delivery).await
    }

    async fn invoke(&self, delivery: Delivery) -> Result<ControlFlow<()>> {
        self.callback.call(delivery).await.map_err(FerryError::Callback)
    }

    async fn resubscribe(
        &self,
        old: Arc<dyn Subscriber>,
        stop: &CancellationToken,
    ) -> Result<Arc<dyn Subscriber>> {
        warn!(address = %self.address, "Provider silent, reopening subscription");
        old.close();

        let fresh = self.connector.subscribe(&self.address, &self.topics).await?;
        let mut state = self.state();
        if stop.is_cancelled() {
            drop(state);
            fresh.close();
            return Ok(fresh);
        }
        state.subscriber = Some(Arc::clone(&fresh));
        Ok(fresh)
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}
