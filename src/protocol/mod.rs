//! PostgreSQL frontend/backend protocol (v3), the subset the proxy speaks

pub mod codec;
pub mod messages;

pub use codec::PgCodec;
pub use messages::{BackendMessage, FrontendMessage};
