#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use shardproxy::{
    Cluster, ClusterOptions, Connector, ConnectorFactory, PoolConfig, ProxyServer, QueryRouter,
    ResultSet, ShardConnection, TransactionStatus, VSchema,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const VSCHEMA: &str = r#"{
    "keyspace": "shop",
    "tables": [
        {"Name": "orders", "Type": "sharded", "VIndexes": [
            {"Columns": ["id"], "Type": "primary"}
        ]},
        {"Name": "countries", "Type": "reference"}
    ]
}"#;

type Handler = Arc<dyn Fn(&str, &str) -> shardproxy::Result<Vec<ResultSet>> + Send + Sync>;

/// Shard backends answering from a closure and logging (database, sql)
#[derive(Clone)]
pub struct MockShards {
    handler: Handler,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockShards {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &str) -> shardproxy::Result<Vec<ResultSet>> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Statements executed outside the bootstrap database
    pub fn shard_statements(&self) -> Vec<(String, String)> {
        self.log
            .lock()
            .iter()
            .filter(|(db, _)| db != "postgres")
            .cloned()
            .collect()
    }
}

impl ConnectorFactory for MockShards {
    fn connector(&self, _host: &str, database: &str) -> shardproxy::Result<Arc<dyn Connector>> {
        Ok(Arc::new(MockConnector {
            database: database.to_string(),
            shards: self.clone(),
        }))
    }
}

struct MockConnector {
    database: String,
    shards: MockShards,
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockConnector({})", self.database)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> shardproxy::Result<Box<dyn ShardConnection>> {
        Ok(Box::new(MockConnection {
            database: self.database.clone(),
            shards: self.shards.clone(),
        }))
    }
}

struct MockConnection {
    database: String,
    shards: MockShards,
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MockConnection({})", self.database)
    }
}

#[async_trait]
impl ShardConnection for MockConnection {
    async fn simple_query(&mut self, sql: &str) -> shardproxy::Result<Vec<ResultSet>> {
        self.shards
            .log
            .lock()
            .push((self.database.clone(), sql.to_string()));
        if sql.starts_with("SELECT 1 FROM pg_database") {
            return Ok(vec![ResultSet::command(0)]);
        }
        (self.shards.handler)(&self.database, sql)
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn transaction_status(&self) -> TransactionStatus {
        TransactionStatus::Idle
    }

    async fn close(self: Box<Self>) -> shardproxy::Result<()> {
        Ok(())
    }
}

/// A proxy listening on an ephemeral port in front of four mock shards
pub struct TestProxy {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub cluster: Arc<Cluster>,
    pub handle: JoinHandle<shardproxy::Result<()>>,
}

impl TestProxy {
    pub async fn start(shards: &MockShards) -> Self {
        let hosts: Vec<String> = (0..4).map(|i| format!("shard{}:5432", i)).collect();
        let options = ClusterOptions {
            bootstrap_database: "postgres".to_string(),
            pool: PoolConfig::new().max_conns(4).lazy_connect(true),
        };
        let cluster = Arc::new(
            Cluster::connect("shop", &hosts, shards, &options)
                .await
                .expect("cluster"),
        );
        let vschema = Arc::new(VSchema::from_json(VSCHEMA).expect("vschema"));
        let router = Arc::new(QueryRouter::new(Arc::clone(&cluster), vschema));

        let server = ProxyServer::bind("127.0.0.1:0", router)
            .await
            .expect("bind");
        let addr = server.local_addr().expect("local addr");
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        Self {
            addr,
            shutdown,
            cluster,
            handle,
        }
    }

    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user=alice dbname=shop sslmode=disable",
            self.addr.ip(),
            self.addr.port()
        )
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("server task")
            .expect("server result");
        self.cluster.shutdown().await;
    }
}
