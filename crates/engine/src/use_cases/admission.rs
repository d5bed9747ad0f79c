//! Dedup & admission of commands arriving from the remote service.
//!
//! Admission is a single insert-if-absent against the command store, so two
//! near-simultaneous deliveries of the same id can never both come back `New`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use storesync_domain::{CommandRecord, CommandState};
use storesync_shared::CommandIssued;

use crate::infrastructure::ports::{ClockPort, CommandStorePort, PutOutcome, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionResult {
    /// First sighting; stored as `Pending`
    New,
    /// Already run (`Executed`, `Acknowledged` or `Failed`): re-send its ack, never re-execute
    DuplicateIgnored,
    /// Already `Pending` or `Executing`: acknowledge receipt only
    DuplicatePending,
}

impl AdmissionResult {
    fn for_existing(state: CommandState) -> Self {
        match state {
            CommandState::Pending | CommandState::Executing => AdmissionResult::DuplicatePending,
            CommandState::Executed | CommandState::Failed | CommandState::Acknowledged => {
                AdmissionResult::DuplicateIgnored
            }
        }
    }
}

/// Outcome of an admission plus the record as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub result: AdmissionResult,
    pub record: CommandRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Admission closed: engine is draining")]
    Closed,

    #[error("Invalid command: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct AdmissionFilter {
    store: Arc<dyn CommandStorePort>,
    clock: Arc<dyn ClockPort>,
    closed: AtomicBool,
}

impl AdmissionFilter {
    pub fn new(store: Arc<dyn CommandStorePort>, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            store,
            clock,
            closed: AtomicBool::new(false),
        }
    }

    pub async fn admit(&self, issued: CommandIssued) -> Result<Admission, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::Closed);
        }

        let command = issued.into_command(self.clock.now());
        command
            .validate()
            .map_err(|e| AdmissionError::Invalid(e.to_string()))?;

        let admission = match self.store.put(command).await? {
            PutOutcome::Inserted(record) => Admission {
                result: AdmissionResult::New,
                record,
            },
            PutOutcome::Existing(record) => Admission {
                result: AdmissionResult::for_existing(record.state),
                record,
            },
        };

        match admission.result {
            AdmissionResult::New => tracing::info!(
                command_id = %admission.record.id(),
                player = %admission.record.player(),
                "Admitted new command"
            ),
            result => tracing::debug!(
                command_id = %admission.record.id(),
                state = %admission.record.state,
                ?result,
                "Duplicate delivery"
            ),
        }
        Ok(admission)
    }

    /// Stop admitting; every later call fails with `Closed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
