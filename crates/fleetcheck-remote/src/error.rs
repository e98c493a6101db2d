use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Credentials were rejected or could not be used.
    #[error("authentication failed for {host}: {reason}")]
    Auth { host: String, reason: String },

    /// Host unreachable: DNS, TCP connect, or handshake failure.
    #[error("cannot reach {host}: {reason}")]
    Network { host: String, reason: String },

    #[error("invalid private key: {0}")]
    KeyFormat(String),

    #[error("command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("command cancelled")]
    Cancelled,

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("ssh channel error: {0}")]
    Channel(String),
}

impl SessionError {
    pub fn auth(host: &str, reason: impl Into<String>) -> Self {
        Self::Auth {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    pub fn network(host: &str, reason: impl Into<String>) -> Self {
        Self::Network {
            host: host.to_string(),
            reason: reason.into(),
        }
    }

    /// Credential problems, including unusable key material.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::KeyFormat(_))
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SessionError::auth("h", "denied").is_auth());
        assert!(SessionError::KeyFormat("no header".into()).is_auth());
        assert!(SessionError::network("h", "refused").is_network());
        assert!(!SessionError::Timeout(Duration::from_secs(5)).is_network());
    }

    #[test]
    fn test_messages() {
        let e = SessionError::network("10.0.0.3:22", "connection refused");
        assert_eq!(e.to_string(), "cannot reach 10.0.0.3:22: connection refused");
        assert_eq!(
            SessionError::Timeout(Duration::from_secs(600)).to_string(),
            "command timed out after 600s"
        );
    }
}
