//! storesync Engine library.
//!
//! Receives purchase commands from the remote commerce service, persists them,
//! executes them against the host game runtime, and reports the outcomes back.
//!
//! ## Structure
//!
//! - `connection/` - authenticated session to the remote service
//! - `use_cases/` - admission, execution scheduling, acknowledgment reporting
//! - `infrastructure/` - ports plus their adapters (SQLite, WebSocket, host)
//! - `coordinator` - lifecycle and wiring

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod infrastructure;
pub mod use_cases;

/// Test fixtures module for component and scenario tests.
#[cfg(test)]
pub mod test_fixtures;

/// End-to-end scenarios against a scripted remote and a standalone host.
#[cfg(test)]
mod e2e_tests;

pub use config::EngineConfig;
pub use coordinator::{EngineState, SyncCoordinator};
pub use error::EngineError;
