//! Error taxonomy shared by the transport, reader, parser and sink.

use std::fmt;

/// Which step of connection negotiation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStage {
    /// DNS resolution or TCP connect
    Connect,
    /// HTTP upgrade rejected
    Upgrade,
    /// WebSocket handshake / protocol negotiation
    Handshake,
    /// Negotiation did not finish within the connect deadline
    Timeout,
}

impl fmt::Display for ConnectStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectStage::Connect => "connect",
            ConnectStage::Upgrade => "upgrade",
            ConnectStage::Handshake => "handshake",
            ConnectStage::Timeout => "timeout",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to connect to {url} ({stage}): {message}")]
    Connect {
        url: String,
        stage: ConnectStage,
        message: String,
    },

    #[error("Not connected to the backend")]
    NotConnected,

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Recv(String),

    #[error("Malformed payload: {0}")]
    Parse(String),

    #[error("Unrecognized response shape: {0}")]
    Malformed(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("No active document to write to")]
    NoDocument,

    #[error("Document write failed: {0}")]
    Sink(String),

    #[error("File selection failed: {0}")]
    Picker(String),

    #[error("History refresh failed: {0}")]
    History(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl RelayError {
    /// True when the connection can no longer be trusted and must be reopened.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RelayError::Connect { .. }
                | RelayError::NotConnected
                | RelayError::Send(_)
                | RelayError::Recv(_)
                | RelayError::Timeout(_)
                | RelayError::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_human_readable() {
        let err = RelayError::Connect {
            url: "ws://localhost:9910".to_string(),
            stage: ConnectStage::Upgrade,
            message: "HTTP 404".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to connect to ws://localhost:9910 (upgrade): HTTP 404"
        );
        assert_eq!(
            RelayError::Timeout("frame".to_string()).to_string(),
            "Timed out waiting for frame"
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(RelayError::Recv("eof".to_string()).is_transport());
        assert!(RelayError::Cancelled.is_transport());
        assert!(!RelayError::NoDocument.is_transport());
        assert!(!RelayError::Parse("x".to_string()).is_transport());
        assert!(!RelayError::Backend("x".to_string()).is_transport());
    }
}
