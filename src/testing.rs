//! In-memory shard backends for unit tests

use crate::connection::postgres::{ConnectorFactory, next_transaction_status};
use crate::connection::{Connector, ResultSet, ShardConnection, TransactionStatus};
use crate::core::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type Handler = Arc<dyn Fn(&str) -> Result<Vec<ResultSet>> + Send + Sync>;

#[derive(Default)]
struct Backend {
    statements: Vec<String>,
    opened: usize,
    closed: usize,
}

/// Hands out connections that record every statement per host and database
#[derive(Clone)]
pub struct MemoryFactory {
    handler: Handler,
    backends: Arc<Mutex<HashMap<(String, String), Backend>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self {
            handler: Arc::new(|_| Ok(vec![ResultSet::command(1)])),
            backends: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Answer every statement with `handler`
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<ResultSet>> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn statements(&self, host: &str, database: &str) -> Vec<String> {
        self.backends
            .lock()
            .get(&(host.to_string(), database.to_string()))
            .map(|b| b.statements.clone())
            .unwrap_or_default()
    }

    pub fn opened_connections(&self, host: &str, database: &str) -> usize {
        self.backends
            .lock()
            .get(&(host.to_string(), database.to_string()))
            .map_or(0, |b| b.opened)
    }

    pub fn closed_connections(&self, host: &str, database: &str) -> usize {
        self.backends
            .lock()
            .get(&(host.to_string(), database.to_string()))
            .map_or(0, |b| b.closed)
    }
}

impl ConnectorFactory for MemoryFactory {
    fn connector(&self, host: &str, database: &str) -> Result<Arc<dyn Connector>> {
        if !host.contains(':') {
            return Err(ProxyError::BadHost(host.to_string()));
        }
        Ok(Arc::new(MemoryConnector {
            key: (host.to_string(), database.to_string()),
            factory: self.clone(),
        }))
    }
}

struct MemoryConnector {
    key: (String, String),
    factory: MemoryFactory,
}

impl fmt::Debug for MemoryConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryConnector({}/{})", self.key.0, self.key.1)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn ShardConnection>> {
        self.factory
            .backends
            .lock()
            .entry(self.key.clone())
            .or_default()
            .opened += 1;
        Ok(Box::new(MemoryConnection {
            key: self.key.clone(),
            factory: self.factory.clone(),
            status: TransactionStatus::Idle,
        }))
    }
}

struct MemoryConnection {
    key: (String, String),
    factory: MemoryFactory,
    status: TransactionStatus,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryConnection({}/{})", self.key.0, self.key.1)
    }
}

#[async_trait]
impl ShardConnection for MemoryConnection {
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
        self.factory
            .backends
            .lock()
            .entry(self.key.clone())
            .or_default()
            .statements
            .push(sql.to_string());

        let outcome = (self.factory.handler)(sql);
        self.status = next_transaction_status(self.status, sql, outcome.is_ok());
        outcome
    }

    fn is_closed(&self) -> bool {
        false
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.factory
            .backends
            .lock()
            .entry(self.key.clone())
            .or_default()
            .closed += 1;
        Ok(())
    }
}
