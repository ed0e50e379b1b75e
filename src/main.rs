use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shardproxy::{Cluster, ProxyConfig, ProxyServer, QueryRouter, VSchema};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ProxyConfig::parse();
    init_tracing(&config.log_filter());

    let vschema = VSchema::load(&config.vschema)
        .with_context(|| format!("failed to load vschema from {}", config.vschema.display()))?;
    let options = config
        .cluster_options()
        .context("invalid pool configuration")?;

    info!(keyspace = %vschema.keyspace, shards = config.hosts.len(), "bootstrapping cluster");
    let cluster = Arc::new(
        Cluster::connect(
            &vschema.keyspace,
            &config.hosts,
            &config.connector_factory(),
            &options,
        )
        .await
        .context("failed to bring up shards")?,
    );

    let router = Arc::new(QueryRouter::new(Arc::clone(&cluster), Arc::new(vschema)));
    let server = ProxyServer::bind(&config.listen, router)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen))?;
    info!(address = %server.local_addr()?, "shardproxy started");

    let shutdown = CancellationToken::new();
    let stats = {
        let cluster = Arc::clone(&cluster);
        let cancel = shutdown.child_token();
        let interval = config.stats_interval;
        tokio::spawn(async move { cluster.run_stats(interval, cancel).await })
    };

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        trigger.cancel();
    });

    let served = server.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(err) = stats.await {
        error!(error = %err, "stats task failed");
    }
    cluster.shutdown().await;
    info!("shardproxy stopped");

    served.context("server error")?;
    Ok(())
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "unable to install Ctrl+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
