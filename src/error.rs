//! WolfMesh Error Types

use thiserror::Error;

/// Result type alias for WolfMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Registration errors
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Address pool {cidr} exhausted")]
    PoolExhausted { cidr: String },

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    // Durable store errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Recovery failed: {0}")]
    Recovery(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Registration rejected ({status}): {message}")]
    RegistrationRejected { status: u16, message: String },

    #[error("Control plane unavailable ({status}): {message}")]
    ServerUnavailable { status: u16, message: String },

    // Tunnel errors
    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Tunnel dead: {0}")]
    TunnelDead(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::Store(_)
                | Error::Network(_)
                | Error::ConnectionTimeout(_)
                | Error::ServerUnavailable { .. }
        )
    }

    /// Check if this error is the caller's fault (fix the request, don't retry)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidIdentity(_) | Error::RegistrationRejected { .. }
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::ConnectionTimeout(
                e.url().map(|u| u.to_string()).unwrap_or_else(|| "control plane".into()),
            )
        } else {
            Error::Network(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(Error::PoolExhausted { cidr: "10.0.0.0/24".into() }.is_retryable());
        assert!(Error::Store("disk full".into()).is_retryable());
        assert!(Error::ServerUnavailable { status: 503, message: String::new() }.is_retryable());

        assert!(!Error::InvalidIdentity("short".into()).is_retryable());
        assert!(Error::InvalidIdentity("short".into()).is_client_error());
        assert!(!Error::RegistrationRejected { status: 400, message: String::new() }.is_retryable());
        assert!(!Error::TunnelDead("all peers stale".into()).is_retryable());
    }
}
