use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tagroute::config::Config;
use tagroute::metrics::LogSink;
use tagroute::proxy::SniListener;
use tagroute::registry::consul::{ConsulClient, ServiceMonitor};
use tagroute::route::TableStore;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to the configured level.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen = %config.proxy.listen,
        consul = %config.registry.addr,
        tag_prefix = %config.registry.tag_prefix,
        poll_interval_ms = config.registry.poll_interval.as_millis() as u64,
        service_monitors = config.registry.service_monitors,
        "starting tagroute"
    );

    let client = Arc::new(
        ConsulClient::new(&config.registry.addr, config.registry.token.as_ref())
            .context("building registry client")?,
    );
    let dc = client
        .agent_datacenter()
        .await
        .context("querying registry datacenter")?;
    info!(datacenter = %dc, "connected to registry");

    let store = Arc::new(TableStore::new());
    let sink = Arc::new(LogSink);

    // Monitor -> rule text -> table, with back-pressure on a slow applier.
    let (updates_tx, mut updates_rx) = mpsc::channel::<String>(1);
    let monitor = ServiceMonitor::new(client, config.registry.clone(), dc);
    tokio::spawn(async move { monitor.watch(updates_tx).await });

    let applier_store = Arc::clone(&store);
    tokio::spawn(async move {
        while let Some(rules) = updates_rx.recv().await {
            applier_store.apply_registry_rules(&rules);
        }
    });

    let listener = Arc::new(SniListener::bind(config.proxy.clone(), store, sink).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    listener.run(shutdown_rx).await?;
    info!("shutdown complete");
    Ok(())
}
