//! Command-line configuration of the proxy binary

use crate::cluster::ClusterOptions;
use crate::connection::config::{PoolConfig, parse_period};
use crate::connection::postgres::PgConnectorFactory;
use crate::core::{ProxyError, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "shardproxy")]
#[command(about = "Transparent PostgreSQL sharding proxy", version)]
pub struct ProxyConfig {
    /// Address clients connect to
    #[arg(long, default_value = "127.0.0.1:15432")]
    pub listen: String,

    /// Shard hosts as host:port, in keyspace order; the count must be a power of two
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "localhost:5432,localhost:5433"
    )]
    pub hosts: Vec<String>,

    /// VSchema JSON document
    #[arg(long, default_value = "vschema.json")]
    pub vschema: PathBuf,

    /// User for shard connections
    #[arg(long, default_value = "postgres")]
    pub user: String,

    /// Password for shard connections
    #[arg(long, default_value = "")]
    pub password: String,

    /// Database used to create missing shard databases
    #[arg(long, default_value = "postgres")]
    pub bootstrap_database: String,

    /// Pool parameter such as pool_max_conns=8 (repeatable)
    #[arg(long = "pool", value_name = "KEY=VALUE", value_parser = parse_pool_param)]
    pub pool_params: Vec<(String, String)>,

    /// Interval between pool statistics log lines
    #[arg(long, default_value = "10s", value_parser = parse_period)]
    pub stats_interval: Duration,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl ProxyConfig {
    pub fn pool_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig::new()
            .apply_params(
                self.pool_params
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )
            .map_err(ProxyError::Config)?;
        config.validate().map_err(ProxyError::Config)?;
        Ok(config)
    }

    pub fn cluster_options(&self) -> Result<ClusterOptions> {
        Ok(ClusterOptions {
            bootstrap_database: self.bootstrap_database.clone(),
            pool: self.pool_config()?,
        })
    }

    pub fn connector_factory(&self) -> PgConnectorFactory {
        PgConnectorFactory::new(&self.user).password(&self.password)
    }

    /// Default tracing filter for the crate
    pub fn log_filter(&self) -> String {
        format!("shardproxy={}", self.log_level)
    }
}

fn parse_pool_param(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}
