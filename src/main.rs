use anyhow::{Context, Result};
use clap::Parser;
use ferry::bus::{TcpConnector, TcpPublisher};
use ferry::chain::{ChainController, ClientChains, ClientServices};
use ferry::cli::{init_logging, Cli};
use ferry::registry::Registries;
use ferry::transfer::{LocalFetcher, TcpRequestClient};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli)?;

    let publisher = TcpPublisher::bind(("0.0.0.0", cli.publish_port))
        .await
        .with_context(|| format!("cannot publish on port {}", cli.publish_port))?;
    info!(address = %publisher.local_addr(), "Publishing announcements");

    let services = ClientServices {
        connector: Arc::new(TcpConnector::default()),
        publisher: Arc::new(publisher),
        requester: Arc::new(TcpRequestClient),
        fetcher: Arc::new(LocalFetcher),
        registries: Registries::new(),
    };
    let controller = Arc::new(ChainController::new(
        ClientChains::new(services),
        cli.config_file.clone(),
    ));

    controller
        .signal_reload()
        .await
        .with_context(|| format!("cannot load {}", cli.config_file.display()))?;
    if !cli.no_watch {
        controller
            .watch()
            .context("cannot watch configuration file")?;
    }

    wait_for_shutdown(&controller).await?;
    controller.stop_all().await;
    info!("Shutdown complete");
    Ok(())
}

/// Serve reload signals until a stop signal arrives.
#[cfg(unix)]
async fn wait_for_shutdown(controller: &ChainController<ClientChains>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("cannot install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration");
                // Failures are logged; the running chains stay up.
                let _ = controller.signal_reload().await;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, stopping");
                return Ok(());
            }
            result = tokio::signal::ctrl_c() => {
                result.context("cannot listen for Ctrl+C")?;
                info!("Interrupted, stopping");
                return Ok(());
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_controller: &ChainController<ClientChains>) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl+C")?;
    info!("Interrupted, stopping");
    Ok(())
}
