//! Error types for port operations.

use storesync_domain::{CommandId, CommandState, DomainError};

/// Command store operation errors with context for debugging.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Command not found: {0}")]
    NotFound(CommandId),

    /// Requested change is outside the transition table; the record keeps its
    /// last valid state.
    #[error("Invalid transition for command {id}: {from} -> {to}")]
    InvalidTransition {
        id: CommandId,
        from: CommandState,
        to: CommandState,
    },

    /// Database operation failed - includes operation name for tracing.
    #[error("Database error in {operation}: {message}")]
    Database {
        operation: &'static str,
        message: String,
    },

    /// Stored row could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn database(operation: &'static str, message: impl ToString) -> Self {
        Self::Database {
            operation,
            message: message.to_string(),
        }
    }

    pub fn serialization(message: impl ToString) -> Self {
        Self::Serialization(message.to_string())
    }

    /// Attach the command id to a domain-level rejection.
    pub fn from_domain(id: &CommandId, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => Self::InvalidTransition {
                id: id.clone(),
                from,
                to,
            },
            DomainError::Validation(msg) => Self::Serialization(msg),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

/// Errors from the session with the remote service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Not connected")]
    NotConnected,

    /// Transient; triggers reconnect with backoff, never drops data
    #[error("Network error: {0}")]
    Network(String),

    /// Fatal until credentials are rotated
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),
}

impl ConnectionError {
    pub fn network(message: impl ToString) -> Self {
        Self::Network(message.to_string())
    }

    pub fn protocol(message: impl ToString) -> Self {
        Self::Protocol(message.to_string())
    }

    /// Only authentication failures stop the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Errors reported by the host runtime for a single command invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Transient (host busy, tick hand-off dropped, timeout); retried up to the cap
    #[error("Execution failed: {0}")]
    Failure(String),

    /// Non-retryable (malformed payload, unknown command); fails immediately
    #[error("Execution rejected: {0}")]
    Rejected(String),
}

impl ExecutionError {
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Failure(msg) | Self::Rejected(msg) => msg,
        }
    }
}
