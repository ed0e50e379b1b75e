pub mod config;
pub mod pool;
pub mod postgres;

use crate::core::Result;
use async_trait::async_trait;
use std::fmt;

/// Transaction status reported by a backend after each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

/// Column metadata of a result set.
///
/// Values always travel in text format; the type OID is the one the shard
/// reported for the column, or `text` when it could not be described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub column_id: i16,
    pub type_oid: u32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

impl FieldDescription {
    /// OID of `text`.
    pub const TEXT_OID: u32 = 25;

    pub fn text(name: impl Into<String>) -> Self {
        Self::typed(name, Self::TEXT_OID, -1)
    }

    /// A text-format column of the given type; `type_size` is -1 for
    /// variable-width types.
    pub fn typed(name: impl Into<String>, type_oid: u32, type_size: i16) -> Self {
        Self {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size,
            type_modifier: -1,
            format: 0,
        }
    }
}

/// One result set returned by a shard for a single statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub fields: Vec<FieldDescription>,
    pub rows: Vec<Vec<Option<String>>>,
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn command(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn with_rows(fields: Vec<FieldDescription>, rows: Vec<Vec<Option<String>>>) -> Self {
        let rows_affected = rows.len() as u64;
        Self {
            fields,
            rows,
            rows_affected,
        }
    }
}

/// A live connection to one shard database.
#[async_trait]
pub trait ShardConnection: Send + fmt::Debug {
    /// Run `sql` through the simple query protocol and collect every
    /// result set it produces.
    async fn simple_query(&mut self, sql: &str) -> Result<Vec<ResultSet>>;

    fn is_closed(&self) -> bool;

    /// True while a command is in flight, or when one was abandoned midway.
    fn is_busy(&self) -> bool;

    fn transaction_status(&self) -> TransactionStatus;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens new connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<Box<dyn ShardConnection>>;
}
