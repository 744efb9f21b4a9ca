//! gantryd — coordinator daemon.
//!
//! Wires the contract port, the module fetcher, and the Kubernetes driver
//! into the coordinator loop, and translates SIGINT/SIGTERM into
//! cancellation. Exits 0 on clean shutdown, 1 on startup or run failure.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use gantry_core::GantryConfig;
use gantry_services::{
    Coordinator, GatewayFetcher, KubeDriver, MirrorFetcher, ModuleFetcher, PlaceholderContract,
    RunError,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run().await {
        tracing::error!(error = %err, "gantryd failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config_path = GantryConfig::write_default_if_missing().context("bootstrap config")?;
    let cfg = GantryConfig::load().context("load config")?;
    tracing::info!(path = %config_path.display(), namespace = %cfg.cluster.namespace, "gantryd starting");

    let client = kube::Client::try_default()
        .await
        .context("build kube client")?;
    let cluster = Arc::new(KubeDriver::new(client, &cfg.cluster.namespace));

    let fetcher: Arc<dyn ModuleFetcher> = if cfg.ipfs.endpoint.is_empty() {
        tracing::info!(mirror = %cfg.ipfs.mirror.display(), "using local wasm mirror");
        Arc::new(MirrorFetcher::new(&cfg.ipfs.mirror))
    } else {
        tracing::info!(endpoint = %cfg.ipfs.endpoint, "using ipfs gateway");
        Arc::new(GatewayFetcher::new(&cfg.ipfs.endpoint).context("ipfs gateway client")?)
    };

    let contract = Arc::new(PlaceholderContract::new());

    let coordinator =
        Coordinator::new(cfg, contract, fetcher, cluster).context("build coordinator")?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    });

    match coordinator.run(cancel).await {
        Ok(()) | Err(RunError::Cancelled) => {
            tracing::info!("gantryd stopped");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
