//! Connection to the remote commerce service: session loop and reconnect backoff.

pub mod backoff;
pub mod manager;

pub use backoff::BackoffState;
pub use manager::{
    ConnectionManager, ConnectionSettings, Credentials, SessionEvent, SessionStatus,
};
