//! Connection lifecycle shared by fieldgate connectors.
//!
//! ## Core Types
//!
//! - [`Connectable`] - Capability trait implemented by protocol drivers
//! - [`ConnectionManager`] - Serialized connect/disconnect with bounded automatic retry
//! - [`ConnectionState`] - Lifecycle states reported to status consumers
//! - [`RetryTimer`] - Single-slot cancellable timer with generation tokens
//! - [`ConnectorError`] - Typed failures with an explicit transport/content split

pub mod error;
pub mod machine;
pub mod retry;
pub mod state;
pub mod traits;

pub use error::{ConnectorError, ErrorKind, Result};
pub use machine::{ConnectionConfig, ConnectionManager, ConnectionStats, DEFAULT_RETRY_INTERVAL};
pub use retry::RetryTimer;
pub use state::ConnectionState;
pub use traits::Connectable;
