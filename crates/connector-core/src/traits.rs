//! Capability traits implemented by protocol drivers.

use async_trait::async_trait;

use crate::error::Result;

/// Anything the connection state machine can open and close.
///
/// Implementations keep their session behind interior mutability so the
/// machine can drive them through a shared reference.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Open the session. Errors are reported to the state machine, which
    /// decides whether a retry is scheduled.
    async fn connect(&self) -> Result<()>;

    /// Release the session. Called both for intentional teardown and as
    /// cleanup after a failed attempt, so it must tolerate a half-open session.
    async fn disconnect(&self) -> Result<()>;

    /// One-shot reachability probe used by administration tooling.
    async fn test_connection(&self) -> Result<()>;
}

#[async_trait]
impl<T: Connectable + ?Sized> Connectable for std::sync::Arc<T> {
    async fn connect(&self) -> Result<()> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<()> {
        (**self).disconnect().await
    }

    async fn test_connection(&self) -> Result<()> {
        (**self).test_connection().await
    }
}
