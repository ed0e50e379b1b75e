// ============================================================================
// shardproxy Library
// ============================================================================

//! Transparent sharding proxy for PostgreSQL
//!
//! Clients talk to a single endpoint using the PostgreSQL v3 protocol. Each
//! statement is parsed, checked against the vschema and sent to the one shard
//! that owns its rows, chosen by hashing the primary vindex values into a
//! 64-bit keyspace split evenly across the shard hosts.
//!
//! # Examples
//!
//! ```no_run
//! use shardproxy::{Cluster, ClusterOptions, PgConnectorFactory, ProxyServer, QueryRouter, VSchema};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let vschema = VSchema::load("vschema.json")?;
//! let hosts = vec!["localhost:5432".to_string(), "localhost:5433".to_string()];
//! let factory = PgConnectorFactory::new("postgres");
//! let cluster = Cluster::connect(&vschema.keyspace, &hosts, &factory, &ClusterOptions::default()).await?;
//!
//! let router = Arc::new(QueryRouter::new(Arc::new(cluster), Arc::new(vschema)));
//! let server = ProxyServer::bind("127.0.0.1:15432", router).await?;
//! server.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod connection;
pub mod core;
pub mod parser;
pub mod protocol;
pub mod router;
pub mod server;
pub mod vschema;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use cluster::{Cluster, ClusterOptions, Shard, keyspace_id};
pub use config::ProxyConfig;
pub use connection::config::PoolConfig;
pub use connection::pool::{ConnectionPool, PoolError, PoolGuard, PoolStats};
pub use connection::postgres::{ConnectorFactory, PgConnectorFactory};
pub use connection::{Connector, FieldDescription, ResultSet, ShardConnection, TransactionStatus};
pub use core::{ProxyError, Result, ShardError};
pub use parser::adapter::SqlParserAdapter;
pub use router::QueryRouter;
pub use server::ProxyServer;
pub use vschema::VSchema;
