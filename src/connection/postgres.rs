use super::{Connector, FieldDescription, ResultSet, ShardConnection, TransactionStatus};
use crate::core::{ProxyError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::types::Type;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::debug;

/// Builds connectors for a shard host and database.
///
/// The cluster bootstrap uses one factory both for the maintenance database
/// and for the per-shard pools.
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, host: &str, database: &str) -> Result<Arc<dyn Connector>>;
}

/// Credentials and timeouts used to reach every shard.
#[derive(Debug, Clone)]
pub struct PgConnectorFactory {
    pub user: String,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl PgConnectorFactory {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl ConnectorFactory for PgConnectorFactory {
    fn connector(&self, host: &str, database: &str) -> Result<Arc<dyn Connector>> {
        let (hostname, port) = host
            .split_once(':')
            .ok_or_else(|| ProxyError::BadHost(host.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ProxyError::BadHost(host.to_string()))?;

        let mut config = tokio_postgres::Config::new();
        config
            .host(hostname)
            .port(port)
            .user(&self.user)
            .dbname(database)
            .application_name("shardproxy")
            .connect_timeout(self.connect_timeout);
        if let Some(password) = &self.password {
            config.password(password);
        }

        Ok(Arc::new(PgConnector {
            label: format!("{}/{}", host, database),
            config,
        }))
    }
}

/// Opens `tokio-postgres` connections to one shard database.
#[derive(Debug, Clone)]
pub struct PgConnector {
    label: String,
    config: tokio_postgres::Config,
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn ShardConnection>> {
        let (client, connection) = self.config.connect(NoTls).await?;
        let label = self.label.clone();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(shard = %label, error = %e, "shard connection terminated");
            }
        });
        debug!(shard = %self.label, "opened shard connection");

        Ok(Box::new(PgConnection {
            client,
            driver,
            busy: false,
            status: TransactionStatus::Idle,
        }))
    }
}

/// A `tokio-postgres` client plus the task driving its socket.
#[derive(Debug)]
pub struct PgConnection {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
    busy: bool,
    status: TransactionStatus,
}

#[async_trait]
impl ShardConnection for PgConnection {
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
        self.busy = true;
        let outcome = self.client.simple_query(sql).await;
        self.status = next_transaction_status(self.status, sql, outcome.is_ok());
        let mut sets = match outcome {
            Ok(messages) => collect_result_sets(messages),
            Err(e) => {
                self.busy = false;
                return Err(e.into());
            }
        };
        if let [set] = sets.as_mut_slice() {
            if !set.fields.is_empty() && self.status == TransactionStatus::Idle {
                self.describe_columns(sql, set).await;
            }
        }
        self.busy = false;
        Ok(sets)
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let PgConnection { client, driver, .. } = *self;
        drop(client);
        driver
            .await
            .map_err(|e| ProxyError::Backend(format!("connection driver failed: {}", e)))
    }
}

impl PgConnection {
    /// Replace the placeholder `text` column types with the ones the shard
    /// reports for `sql`.
    ///
    /// The simple query protocol only exposes column names, so the statement
    /// is described once more through an unnamed prepare. Failures keep the
    /// `text` placeholders.
    async fn describe_columns(&self, sql: &str, set: &mut ResultSet) {
        match self.client.prepare(sql).await {
            Ok(statement) if statement.columns().len() == set.fields.len() => {
                for (field, column) in set.fields.iter_mut().zip(statement.columns()) {
                    *field = describe_field(column.name(), column.type_());
                }
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "could not describe result columns"),
        }
    }
}

fn describe_field(name: &str, ty: &Type) -> FieldDescription {
    FieldDescription::typed(name, ty.oid(), type_size(ty))
}

/// `typlen` of the fixed-width builtin types, -1 for everything else.
fn type_size(ty: &Type) -> i16 {
    if [Type::BOOL, Type::CHAR].contains(ty) {
        1
    } else if *ty == Type::INT2 {
        2
    } else if [Type::INT4, Type::OID, Type::FLOAT4, Type::DATE].contains(ty) {
        4
    } else if [Type::INT8, Type::FLOAT8, Type::TIME, Type::TIMESTAMP, Type::TIMESTAMPTZ].contains(ty) {
        8
    } else if *ty == Type::UUID {
        16
    } else {
        -1
    }
}

/// Group the flat simple-query message stream into one set per statement.
fn collect_result_sets(messages: Vec<SimpleQueryMessage>) -> Vec<ResultSet> {
    let mut sets = Vec::new();
    let mut current: Option<ResultSet> = None;

    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                current = Some(ResultSet {
                    fields: columns
                        .iter()
                        .map(|c| FieldDescription::text(c.name()))
                        .collect(),
                    ..ResultSet::default()
                });
            }
            SimpleQueryMessage::Row(row) => {
                let set = current.get_or_insert_with(|| ResultSet {
                    fields: row
                        .columns()
                        .iter()
                        .map(|c| FieldDescription::text(c.name()))
                        .collect(),
                    ..ResultSet::default()
                });
                set.rows
                    .push((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect());
            }
            SimpleQueryMessage::CommandComplete(rows_affected) => {
                let mut set = current.take().unwrap_or_default();
                set.rows_affected = rows_affected;
                sets.push(set);
            }
            _ => {}
        }
    }

    sets
}

/// Track the backend's transaction status from the statements sent to it.
///
/// `tokio-postgres` does not expose the status byte of ReadyForQuery, so
/// the transaction-control keywords are followed instead.
pub(crate) fn next_transaction_status(
    current: TransactionStatus,
    sql: &str,
    succeeded: bool,
) -> TransactionStatus {
    let keyword = sql
        .trim_start()
        .split(|c: char| c.is_whitespace() || c == ';')
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match keyword.as_str() {
        "COMMIT" | "END" | "ROLLBACK" | "ABORT" => TransactionStatus::Idle,
        _ if !succeeded && current != TransactionStatus::Idle => TransactionStatus::Failed,
        "BEGIN" | "START" if succeeded => TransactionStatus::InTransaction,
        _ => current,
    }
}
