use thiserror::Error;

use crate::connection::pool::PoolError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("shard count must be a power of two, got {0}")]
    ShardCount(usize),

    #[error("bad host configuration '{0}', please specify host:port")]
    BadHost(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("VSchema error: {0}")]
    VSchema(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Validation(String),

    #[error("cannot find shard owner of keyspace id {0:#018x}")]
    NoTargetShard(u64),

    #[error("{}", .0.message)]
    Shard(Box<ShardError>),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for failures that leave the client socket unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}

/// Diagnostic fields reported by a shard, kept as-is so they can be
/// forwarded to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

impl From<ShardError> for ProxyError {
    fn from(err: ShardError) -> Self {
        Self::Shard(Box::new(err))
    }
}

impl From<&tokio_postgres::error::DbError> for ShardError {
    fn from(db: &tokio_postgres::error::DbError) -> Self {
        use tokio_postgres::error::ErrorPosition;

        let (position, internal_position, internal_query) = match db.position() {
            Some(ErrorPosition::Original(pos)) => (Some(*pos), None, None),
            Some(ErrorPosition::Internal { position, query }) => {
                (None, Some(*position), Some(query.clone()))
            }
            None => (None, None, None),
        };

        Self {
            severity: db.severity().to_string(),
            code: db.code().code().to_string(),
            message: db.message().to_string(),
            detail: db.detail().map(str::to_string),
            hint: db.hint().map(str::to_string),
            position,
            internal_position,
            internal_query,
            where_: db.where_().map(str::to_string),
            schema: db.schema().map(str::to_string),
            table: db.table().map(str::to_string),
            column: db.column().map(str::to_string),
            data_type: db.datatype().map(str::to_string),
            constraint: db.constraint().map(str::to_string),
            file: db.file().map(str::to_string),
            line: db.line(),
            routine: db.routine().map(str::to_string),
        }
    }
}

impl From<tokio_postgres::Error> for ProxyError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) => Self::from(ShardError::from(db)),
            None => Self::Backend(err.to_string()),
        }
    }
}
