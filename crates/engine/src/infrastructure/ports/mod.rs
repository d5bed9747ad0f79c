//! Port traits for infrastructure boundaries.
//!
//! Ports exist for:
//! - Command persistence (SQLite, or in-memory for tests)
//! - The remote service transport (WebSocket, or in-memory for tests)
//! - The host game runtime (one implementation per server flavor)
//! - Time, so delays and retention are testable

mod error;
mod external;
mod store;
mod time;

pub use error::{ConnectionError, ExecutionError, StoreError};

// =============================================================================
// Store Port
// =============================================================================
pub use store::{CommandStorePort, PendingCursor, PendingScan, PutOutcome};

// =============================================================================
// External Service Ports
// =============================================================================
pub use external::{
    ExecutionRequest, HostRuntime, MessageSink, Transport, TransportChannel,
};

// =============================================================================
// Time
// =============================================================================
pub use time::ClockPort;

// =============================================================================
// Test-Only Mocks (only available during test builds)
// =============================================================================
#[cfg(test)]
pub use external::{MockHostRuntime, MockMessageSink};
#[cfg(test)]
pub use store::MockCommandStorePort;
#[cfg(test)]
pub use time::MockClockPort;
