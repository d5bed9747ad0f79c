//! storesync Domain
//!
//! Core vocabulary shared by the engine and the wire protocol: remote-issued
//! commands, their lifecycle state machine, and per-player pending queues.
//! No I/O lives here.

pub mod command;
pub mod error;
pub mod ids;
pub mod pending_queue;

pub use command::{AckOutcome, Command, CommandRecord, CommandState, StateUpdate};
pub use error::DomainError;
pub use ids::{CommandId, PlayerId};
pub use pending_queue::{PendingQueue, QueuedCommand};
