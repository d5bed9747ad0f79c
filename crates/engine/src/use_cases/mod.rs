//! Use cases - the command pipeline between the connection and the host.
//!
//! - [`admission`] - dedup and admission of issued commands
//! - [`scheduler`] - execution against the host runtime
//! - [`reporter`] - acknowledgment delivery back to the remote service

pub mod admission;
pub mod reporter;
pub mod scheduler;

pub use admission::{Admission, AdmissionError, AdmissionFilter, AdmissionResult};
pub use reporter::{AckReport, AckReporter, ReporterHandle};
pub use scheduler::{ExecutionScheduler, SchedulerSettings};
