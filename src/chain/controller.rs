//! Chain lifecycle controller.

use crate::chain::watcher::ConfigWatcher;
use crate::chain::{ChainSet, ConfigReloader, ReloadReport, Terminator};
use crate::error::Result;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Quiet period after a file event before reloading, so a burst of events
/// from one save triggers a single reload.
const SETTLE_DELAY: Duration = Duration::from_millis(200);

struct WatchTask {
    _watcher: ConfigWatcher,
    /// Ends the loop between reloads, never during one.
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the process-wide chain set.
///
/// Reloads run one at a time; the chain set lock is held for the whole
/// reload so a file event and a reload signal cannot interleave.
pub struct ChainController<K> {
    kind: K,
    config_path: PathBuf,
    chains: tokio::sync::Mutex<ChainSet>,
    watch: Mutex<Option<WatchTask>>,
}

impl<K> ChainController<K>
where
    K: ConfigReloader + Terminator + 'static,
{
    pub fn new(kind: K, config_path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            config_path: config_path.into(),
            chains: tokio::sync::Mutex::new(ChainSet::new()),
            watch: Mutex::new(None),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Apply `path` to the running chain set. A rejected file leaves the
    /// running chains untouched.
    pub async fn reload_config(&self, path: &Path) -> Result<ReloadReport> {
        let mut chains = self.chains.lock().await;
        match self.kind.reload(path, &mut chains).await {
            Ok(report) => {
                info!(config = %path.display(), "Configuration loaded: {}", report);
                Ok(report)
            }
            Err(e) => {
                error!(
                    config = %path.display(),
                    error = %e,
                    running = chains.len(),
                    "Configuration rejected, keeping running chains"
                );
                Err(e)
            }
        }
    }

    /// Reload the configured file (the external reload trigger).
    pub async fn signal_reload(&self) -> Result<ReloadReport> {
        self.reload_config(&self.config_path).await
    }

    /// Start reloading whenever the configuration file changes on disk.
    pub fn watch(self: &Arc<Self>) -> Result<()> {
        let (watcher, mut events) = ConfigWatcher::start(&self.config_path)?;
        let controller = Arc::downgrade(self);
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    event = events.recv() => if event.is_none() { break },
                }
                tokio::select! {
                    _ = stopped.cancelled() => break,
                    _ = tokio::time::sleep(SETTLE_DELAY) => {}
                }
                while events.try_recv().is_ok() {}

                let Some(controller) = controller.upgrade() else {
                    break;
                };
                // Failures are logged by reload_config.
                let _ = controller.signal_reload().await;
            }
        });

        let previous = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(WatchTask {
                _watcher: watcher,
                cancel,
                task,
            });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        debug!(config = %self.config_path.display(), "Watching configuration file");
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop the file watcher, then terminate every chain. A reload already
    /// under way is allowed to finish first.
    pub async fn stop_all(&self) {
        let watch = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(watch) = watch {
            watch.cancel.cancel();
            if let Err(e) = watch.task.await {
                error!(error = %e, "Configuration watch task failed");
            }
        }

        let mut chains = self.chains.lock().await;
        let count = chains.len();
        self.kind.terminate(&mut chains).await;
        info!(chains = count, "All chains stopped");
    }

    pub async fn chain_names(&self) -> Vec<String> {
        self.chains.lock().await.keys().cloned().collect()
    }
}
