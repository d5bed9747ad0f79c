//! Top-level engine error.
//!
//! Aggregates the component errors so that the coordinator and the binary
//! can handle failures from every layer uniformly.

use thiserror::Error;

use crate::coordinator::EngineState;
use crate::infrastructure::ports::{ConnectionError, StoreError};
use crate::use_cases::AdmissionError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Command store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Remote session failure.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Outstanding acknowledgments could not be delivered in time.
    #[error("Acknowledgment delivery failed: {0}")]
    AckDelivery(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Lifecycle operation called from the wrong state.
    #[error("Engine is {actual}, expected {expected}")]
    InvalidLifecycle {
        expected: EngineState,
        actual: EngineState,
    },
}

impl EngineError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
