//! Chain lifecycle.
//!
//! A chain is one named configuration bound to a running set of listeners
//! (one per provider) and the transfer protocol their pushes drive. The
//! [`ChainController`] owns the chain set; what reload and terminate mean
//! for a given kind of chain is supplied through [`ConfigReloader`] and
//! [`Terminator`], chosen once when the controller is built.
//!
//! ```text
//!   config file ──► ChainController ──► ConfigReloader::reload
//!                        │                  ├─ stop removed/changed chains
//!                        │                  └─ start added/changed chains
//!                        └──────────────► Terminator::terminate (stop_all)
//! ```

pub mod controller;
pub mod watcher;

pub use controller::ChainController;
pub use watcher::ConfigWatcher;

use crate::bus::{Connector, Publisher};
use crate::config::{ChainConfig, FerryConfig};
use crate::error::Result;
use crate::listener::{Callback, Delivery, Listener};
use crate::message::MessageType;
use crate::registry::Registries;
use crate::transfer::{terminate_transfers, Fetcher, RequestClient, TransferProtocol};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Running chains by name
pub type ChainSet = BTreeMap<String, Chain>;

/// Applies a configuration file to a chain set.
#[async_trait]
pub trait ConfigReloader: Send + Sync {
    /// Bring `chains` in line with the file at `path`. On error `chains` is
    /// left as it was.
    async fn reload(&self, path: &Path, chains: &mut ChainSet) -> Result<ReloadReport>;
}

/// Tears a chain set down at shutdown.
#[async_trait]
pub trait Terminator: Send + Sync {
    /// Stop every chain and cancel in-flight transfers. Leaves `chains` empty.
    async fn terminate(&self, chains: &mut ChainSet);
}

/// Outcome of comparing a running chain set against a new configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReloadReport {
    pub fn diff(running: &ChainSet, wanted: &BTreeMap<String, ChainConfig>) -> Self {
        let mut report = Self::default();
        for (name, config) in wanted {
            match running.get(name) {
                None => report.added.push(name.clone()),
                Some(chain) if chain.config() == config => report.unchanged.push(name.clone()),
                Some(_) => report.changed.push(name.clone()),
            }
        }
        report.removed = running
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();
        report
    }

    /// Whether the reload leaves the running set as it was.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    fn to_stop(&self) -> impl Iterator<Item = &String> {
        self.removed.iter().chain(&self.changed)
    }

    fn to_start(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(&self.changed)
    }
}

impl fmt::Display for ReloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} removed, {} changed, {} unchanged",
            self.added.len(),
            self.removed.len(),
            self.changed.len(),
            self.unchanged.len()
        )
    }
}

/// Collaborators shared by every client chain.
#[derive(Clone)]
pub struct ClientServices {
    pub connector: Arc<dyn Connector>,
    pub publisher: Arc<dyn Publisher>,
    pub requester: Arc<dyn RequestClient>,
    pub fetcher: Arc<dyn Fetcher>,
    pub registries: Registries,
}

/// Routes listener deliveries for a client chain.
struct ClientHandler {
    protocol: Arc<TransferProtocol>,
    publisher: Arc<dyn Publisher>,
    registries: Registries,
}

#[async_trait]
impl Callback for ClientHandler {
    async fn call(&self, delivery: Delivery) -> anyhow::Result<ControlFlow<()>> {
        let kind = delivery.message().kind;
        match kind {
            MessageType::Push => self.protocol.spawn_delivery(delivery),
            MessageType::File => {
                let message = delivery.message();
                if let Some(uid) = message.uid() {
                    if self.registries.completed.add(uid) {
                        debug!(%uid, "File available, announcing");
                        self.publisher.publish(message.clone()).await?;
                    }
                }
            }
            MessageType::Ack => debug!(uid = ?delivery.message().uid(), "Transfer acknowledged"),
            MessageType::Beat => {}
        }
        Ok(ControlFlow::Continue(()))
    }
}

pub struct Chain {
    name: String,
    config: ChainConfig,
    protocol: Arc<TransferProtocol>,
    listeners: Vec<Arc<Listener>>,
    supervisors: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Chain {
    /// Build the chain's listeners and protocol without starting anything.
    pub fn build(name: &str, config: ChainConfig, services: &ClientServices) -> Result<Self> {
        let protocol = Arc::new(TransferProtocol::new(
            services.registries.clone(),
            Arc::clone(&services.requester),
            Arc::clone(&services.fetcher),
            Arc::clone(&services.publisher),
            config.transfer_settings(),
        ));
        let handler: Arc<dyn Callback> = Arc::new(ClientHandler {
            protocol: Arc::clone(&protocol),
            publisher: Arc::clone(&services.publisher),
            registries: services.registries.clone(),
        });

        let listeners = config
            .providers
            .iter()
            .map(|provider| {
                Listener::new(
                    provider.clone(),
                    config.topics.clone(),
                    Arc::clone(&handler),
                    config.listener_options(),
                    Arc::clone(&services.connector),
                    services.registries.clone(),
                )
                .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: name.to_string(),
            config,
            protocol,
            listeners,
            supervisors: Vec::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn one supervisor per listener.
    pub fn start(&mut self) {
        let restart_delay = self.config.restart_delay();
        for listener in &self.listeners {
            self.supervisors.push(tokio::spawn(supervise(
                self.name.clone(),
                Arc::clone(listener),
                self.shutdown.clone(),
                restart_delay,
            )));
        }
        info!(chain = %self.name, listeners = self.listeners.len(), "Chain started");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<TransferProtocol> {
        &self.protocol
    }

    pub fn listeners(&self) -> &[Arc<Listener>] {
        &self.listeners
    }

    /// Stop supervision and every listener. In-flight transfers keep running.
    pub fn stop_listeners(&self) {
        self.shutdown.cancel();
        for listener in &self.listeners {
            listener.stop();
        }
    }

    async fn join_supervisors(&mut self) {
        for supervisor in self.supervisors.drain(..) {
            let _ = supervisor.await;
        }
    }

    /// Stop listeners, cancel this chain's transfers, and wait for both.
    pub async fn stop(mut self) {
        self.stop_listeners();
        self.join_supervisors().await;
        self.protocol.terminate().await;
        info!(chain = %self.name, "Chain stopped");
    }
}

/// Keep `listener` running until `shutdown`: a clean exit ends supervision,
/// an error restarts it after `restart_delay`.
async fn supervise(
    chain: String,
    listener: Arc<Listener>,
    shutdown: CancellationToken,
    restart_delay: Duration,
) {
    loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                listener.stop();
                return;
            }
            result = listener.run() => result,
        };

        match result {
            Ok(()) => {
                debug!(%chain, address = %listener.address(), "Listener exited");
                return;
            }
            Err(_) if shutdown.is_cancelled() => return,
            Err(e) => {
                error!(
                    %chain,
                    address = %listener.address(),
                    error = %e,
                    "Listener failed, restarting in {:?}",
                    restart_delay
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(restart_delay) => {}
        }
    }
}

/// Reload and terminate behavior for client chains.
pub struct ClientChains {
    services: ClientServices,
}

impl ClientChains {
    pub fn new(services: ClientServices) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &ClientServices {
        &self.services
    }
}

#[async_trait]
impl ConfigReloader for ClientChains {
    async fn reload(&self, path: &Path, chains: &mut ChainSet) -> Result<ReloadReport> {
        let mut config = FerryConfig::load(path)?;
        let report = ReloadReport::diff(chains, &config.chains);

        // Build everything before touching the running set.
        let mut fresh = Vec::new();
        for name in report.to_start() {
            if let Some(chain_config) = config.chains.remove(name) {
                fresh.push(Chain::build(name, chain_config, &self.services)?);
            }
        }

        for name in report.to_stop() {
            if let Some(chain) = chains.remove(name) {
                chain.stop().await;
            }
        }
        for mut chain in fresh {
            chain.start();
            chains.insert(chain.name.clone(), chain);
        }
        Ok(report)
    }
}

#[async_trait]
impl Terminator for ClientChains {
    async fn terminate(&self, chains: &mut ChainSet) {
        for chain in chains.values() {
            chain.stop_listeners();
        }
        terminate_transfers(chains.values().map(|chain| chain.protocol.as_ref())).await;
        for (_, mut chain) in std::mem::take(chains) {
            chain.join_supervisors().await;
            debug!(chain = %chain.name, "Chain terminated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::transfer::{LocalFetcher, TcpRequestClient};

    fn services(bus: &MemoryBus) -> ClientServices {
        ClientServices {
            connector: Arc::new(bus.clone()),
            publisher: Arc::new(bus.clone()),
            requester: Arc::new(TcpRequestClient),
            fetcher: Arc::new(LocalFetcher),
            registries: Registries::new(),
        }
    }

    fn chain_config(providers: &[&str]) -> ChainConfig {
        let text = format!(
            "[chains.c]\nproviders = {:?}\ntopics = [\"/x\"]\ndestination = \"/tmp/ferry\"",
            providers
        );
        FerryConfig::parse(&text).unwrap().chains.remove("c").unwrap()
    }

    #[test]
    fn test_report_diff() {
        let bus = MemoryBus::new();
        let services = services(&bus);
        let mut running = ChainSet::new();
        for name in ["keep", "edit", "drop"] {
            running.insert(
                name.to_string(),
                Chain::build(name, chain_config(&["a:1"]), &services).unwrap(),
            );
        }

        let mut wanted = BTreeMap::new();
        wanted.insert("keep".to_string(), chain_config(&["a:1"]));
        wanted.insert("edit".to_string(), chain_config(&["b:2"]));
        wanted.insert("new".to_string(), chain_config(&["a:1"]));

        let report = ReloadReport::diff(&running, &wanted);
        assert_eq!(report.added, vec!["new"]);
        assert_eq!(report.removed, vec!["drop"]);
        assert_eq!(report.changed, vec!["edit"]);
        assert_eq!(report.unchanged, vec!["keep"]);
        assert!(!report.is_noop());
        assert_eq!(report.to_string(), "1 added, 1 removed, 1 changed, 1 unchanged");
    }

    #[test]
    fn test_build_one_listener_per_provider() {
        let bus = MemoryBus::new();
        let chain = Chain::build("c", chain_config(&["a:1", "b:2"]), &services(&bus)).unwrap();

        let addresses: Vec<_> = chain.listeners().iter().map(|l| l.address()).collect();
        assert_eq!(addresses, vec!["a:1", "b:2"]);
        assert!(chain.listeners().iter().all(|l| !l.is_running()));
    }

    #[tokio::test]
    async fn test_start_and_stop_chain() {
        let bus = MemoryBus::new();
        let mut chain = Chain::build("c", chain_config(&["a:1"]), &services(&bus)).unwrap();
        chain.start();

        while bus.subscriber_count("a:1") == 0 {
            tokio::task::yield_now().await;
        }
        assert!(chain.listeners()[0].is_running());

        let listener = Arc::clone(&chain.listeners()[0]);
        chain.stop().await;
        assert!(!listener.is_running());
        assert!(!listener.has_subscriber());
        assert_eq!(bus.subscriber_count("a:1"), 0);
    }
}
