//! Unified error types for the domain layer

use thiserror::Error;

use crate::command::CommandState;

/// Unified error type for domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Validation failed (e.g., blank identifiers or payloads)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The requested state change is not in the legal transition table
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: CommandState, to: CommandState },
}

impl DomainError {
    /// Creates a validation error.
    ///
    /// # Example
    /// ```ignore
    /// if payload.trim().is_empty() {
    ///     return Err(DomainError::validation("payload cannot be empty"));
    /// }
    /// ```
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid transition error
    pub fn invalid_transition(from: CommandState, to: CommandState) -> Self {
        Self::InvalidTransition { from, to }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}
