//! Connector error types.

use std::time::Duration;

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ConnectorError>;

/// Errors raised by connector drivers.
///
/// Drivers pick the variant; callers branch on [`ConnectorError::kind`]
/// and never on the message text.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Connectivity, authentication or socket failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The destination refused the payload itself.
    #[error("Content error: {0}")]
    Content(String),

    /// Malformed settings detected while building a connector.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation did not finish before its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Failure class used to route an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Content,
    Filesystem,
    Configuration,
    Other,
}

impl ConnectorError {
    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a content error.
    pub fn content(msg: impl Into<String>) -> Self {
        Self::Content(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) | Self::Timeout(_) => ErrorKind::Transport,
            Self::Content(_) => ErrorKind::Content,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Filesystem,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the failure should leave data pending and trigger a reconnect.
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(ConnectorError::transport("reset").kind(), ErrorKind::Transport);
        assert_eq!(
            ConnectorError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Transport
        );
        assert_eq!(ConnectorError::content("bad").kind(), ErrorKind::Content);
        assert_eq!(ConnectorError::config("proxy").kind(), ErrorKind::Configuration);

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(ConnectorError::from(io).kind(), ErrorKind::Filesystem);
    }

    #[test]
    fn test_message_does_not_drive_classification() {
        let err = ConnectorError::content("connection refused by schema validator");
        assert!(!err.is_transport());
    }
}
