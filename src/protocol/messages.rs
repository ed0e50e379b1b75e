use crate::connection::{FieldDescription, TransactionStatus};
use crate::core::ShardError;

/// Protocol version 3.0 as sent in a StartupMessage
pub const PROTOCOL_VERSION_3: i32 = 196_608;
pub const SSL_REQUEST_CODE: i32 = 80_877_103;
pub const GSSENC_REQUEST_CODE: i32 = 80_877_104;
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Process id and secret key announced in BackendKeyData
pub const BACKEND_PROCESS_ID: i32 = 17_399;
pub const BACKEND_SECRET_KEY: i32 = 1_755_195_487;

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrontendMessage {
    SslRequest,
    GssEncRequest,
    CancelRequest { process_id: i32, secret_key: i32 },
    Startup {
        version: i32,
        params: Vec<(String, String)>,
    },
    Query(String),
    Terminate,
    Sync,
    /// Any other regular message, identified by its tag
    Other(u8),
}

/// Messages sent to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendMessage {
    /// Single `N` byte refusing SSL or GSS encryption, sent unframed
    SslDeny,
    AuthenticationOk,
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<String>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(Box<ShardError>),
}

impl BackendMessage {
    pub fn parameter_status(name: impl Into<String>, value: impl Into<String>) -> Self {
        BackendMessage::ParameterStatus {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn error(fields: ShardError) -> Self {
        BackendMessage::ErrorResponse(Box::new(fields))
    }
}

/// Error fields for a failure that did not come from a shard
pub fn local_error(message: impl Into<String>) -> ShardError {
    ShardError {
        severity: "ERROR".to_string(),
        code: "XX000".to_string(),
        message: message.into(),
        ..ShardError::default()
    }
}

/// Error fields announcing that the proxy is shutting the session down
pub fn admin_shutdown() -> ShardError {
    ShardError {
        severity: "FATAL".to_string(),
        code: "57P01".to_string(),
        message: "terminating connection due to administrator command".to_string(),
        routine: Some("ProcessInterrupts".to_string()),
        ..ShardError::default()
    }
}

/// Parameters reported after authentication, in order
///
/// `session_authorization` echoes the startup user.
pub fn server_parameters(user: &str) -> Vec<(&'static str, String)> {
    vec![
        ("client_encoding", "UNICODE".to_string()),
        ("DateStyle", "ISO, MDY".to_string()),
        ("integer_datetimes", "on".to_string()),
        ("IntervalStyle", "postgres".to_string()),
        ("is_superuser", "on".to_string()),
        ("server_encoding", "UTF8".to_string()),
        ("server_version", "12.3".to_string()),
        ("session_authorization", user.to_string()),
        ("standard_conforming_strings", "on".to_string()),
        ("TimeZone", "Europe/Paris".to_string()),
    ]
}
