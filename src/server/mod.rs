//! Client-facing side of the proxy

pub mod listener;
pub mod session;

pub use listener::{ProxyServer, ServerMetrics};
pub use session::{SessionState, WireSession};
