pub mod shard;

pub use shard::{Shard, ShardSpec, build_shards, keyspace_id};

use crate::connection::config::PoolConfig;
use crate::connection::pool::{ConnectionPool, PoolStats};
use crate::connection::postgres::ConnectorFactory;
use crate::connection::ShardConnection;
use crate::core::{ProxyError, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The ordered set of shards covering the whole keyspace
#[derive(Debug)]
pub struct Cluster {
    shards: Vec<Shard>,
}

/// Settings for bringing up a cluster
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Database used for the existence check and `CREATE DATABASE`
    pub bootstrap_database: String,
    pub pool: PoolConfig,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            bootstrap_database: "postgres".to_string(),
            pool: PoolConfig::default(),
        }
    }
}

impl Cluster {
    /// Partition the keyspace over `hosts`, create each shard database if
    /// needed and open one pool per shard
    ///
    /// Shards are bootstrapped one after the other. Two proxies starting
    /// against the same hosts at once may race on `CREATE DATABASE`; the
    /// loser fails startup with the shard's duplicate-database error.
    pub async fn connect(
        keyspace: &str,
        hosts: &[String],
        factory: &dyn ConnectorFactory,
        options: &ClusterOptions,
    ) -> Result<Self> {
        let specs = build_shards(keyspace, hosts)?;
        let mut shards = Vec::with_capacity(specs.len());

        for spec in specs {
            match open_shard(&spec, factory, options).await {
                Ok(pool) => {
                    info!(shard = %spec.name, host = %spec.host, "shard ready");
                    shards.push(Shard::new(spec, pool));
                }
                Err(e) => {
                    warn!(shard = %spec.name, host = %spec.host, error = %e, "shard bootstrap failed");
                    Self { shards }.shutdown().await;
                    return Err(e);
                }
            }
        }

        Ok(Self { shards })
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Find the shard owning the keyspace id of `key`
    pub fn shard_for_keyspace_id(&self, key: &str) -> Result<&Shard> {
        let id = keyspace_id(key);
        self.shards
            .iter()
            .find(|s| s.owns(id))
            .ok_or(ProxyError::NoTargetShard(id))
    }

    /// Close every shard pool, waiting for checked-out connections
    pub async fn shutdown(&self) {
        futures::future::join_all(self.shards.iter().map(|s| s.pool.close())).await;
        debug!(shards = self.shards.len(), "cluster shut down");
    }

    pub fn stats(&self) -> Vec<(&str, PoolStats)> {
        self.shards
            .iter()
            .map(|s| (s.name(), s.pool.stats()))
            .collect()
    }

    /// Log pool statistics of every shard each `interval` until `cancel` fires
    pub async fn run_stats(&self, interval: Duration, cancel: CancellationToken) {
        if interval.is_zero() {
            warn!("stats interval is zero, pool stats disabled");
            return;
        }
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for (shard, stats) in self.stats() {
                info!(
                    shard = %shard,
                    acquired = stats.acquired_conns,
                    acquire_count = stats.acquire_count,
                    empty_acquire_count = stats.empty_acquire_count,
                    idle = stats.idle_conns,
                    total = stats.total_conns,
                    "pool stats"
                );
            }
        }
    }
}

async fn open_shard(
    spec: &ShardSpec,
    factory: &dyn ConnectorFactory,
    options: &ClusterOptions,
) -> Result<ConnectionPool> {
    bootstrap_database(spec, factory, &options.bootstrap_database).await?;
    let connector = factory.connector(&spec.host, &spec.name)?;
    ConnectionPool::connect(spec.name.clone(), options.pool.clone(), connector).await
}

async fn bootstrap_database(
    spec: &ShardSpec,
    factory: &dyn ConnectorFactory,
    bootstrap_database: &str,
) -> Result<()> {
    let mut conn = factory
        .connector(&spec.host, bootstrap_database)?
        .connect()
        .await?;
    let outcome = ensure_database(conn.as_mut(), &spec.name).await;
    if let Err(e) = conn.close().await {
        debug!(host = %spec.host, error = %e, "error closing bootstrap connection");
    }
    outcome
}

async fn ensure_database(conn: &mut dyn ShardConnection, name: &str) -> Result<()> {
    let check = format!(
        "SELECT 1 FROM pg_database WHERE datname = {}",
        quote_literal(name)
    );
    let exists = conn
        .simple_query(&check)
        .await?
        .iter()
        .any(|set| !set.rows.is_empty());

    if !exists {
        conn.simple_query(&format!("CREATE DATABASE {}", quote_identifier(name)))
            .await?;
        info!(database = %name, "created shard database");
    }
    Ok(())
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}
