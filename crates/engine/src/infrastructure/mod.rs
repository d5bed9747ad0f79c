//! Infrastructure implementations.
//!
//! Contains port trait implementations for external dependencies.

pub mod clock;
pub mod host;
pub mod memory_store;
pub mod ports;
pub mod sqlite_store;
pub mod websocket;

#[cfg(test)]
mod store_integration_tests;
