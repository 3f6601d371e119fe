//! Error types for the jobwire client.
//!
//! The variants follow the client's failure taxonomy: transport reachability,
//! authentication, protocol shape, remote action failures, connection loss and
//! shutdown. Errors are `Clone` so that one fatal failure can be handed to every
//! caller still waiting on the worker.

use thiserror::Error;

/// Main error type for the jobwire client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    // Transport errors
    #[error("Could not connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {message}")]
    Io { message: String },

    // Authentication errors
    #[error("Authentication failed: {0}")]
    Auth(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {message}")]
    Json { message: String },

    #[error("API error in {controller}.{action}: {message}")]
    Action {
        controller: String,
        action: String,
        message: String,
    },

    // Session lifecycle errors
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("In shutdown: actions disallowed")]
    InShutdown,

    #[error("Session did not close cleanly during shutdown: {0}")]
    ShutdownInvariant(String),

    #[error("Client is closed")]
    Closed,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for jobwire operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Json {
            message: err.to_string(),
        }
    }
}

impl ClientError {
    /// Create a `Config` error from any displayable message.
    pub fn config(message: impl Into<String>) -> Self {
        ClientError::Config {
            message: message.into(),
        }
    }

    /// Check if this error should trigger a reconnect instead of failing the client.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Connect { .. } | ClientError::ConnectionLost(_) | ClientError::Io { .. }
        )
    }

    /// Errors that end the client for good.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Auth(_) | ClientError::Bootstrap(_) | ClientError::Config { .. }
        )
    }
}
