//! Command store port - the single authority over command state.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use storesync_domain::{Command, CommandId, CommandRecord, PlayerId, StateUpdate};

use super::error::StoreError;

/// Result of an insert-if-absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted(CommandRecord),
    /// Id was already present; nothing was written
    Existing(CommandRecord),
}

impl PutOutcome {
    pub fn record(&self) -> &CommandRecord {
        match self {
            PutOutcome::Inserted(record) | PutOutcome::Existing(record) => record,
        }
    }

    pub fn into_record(self) -> CommandRecord {
        match self {
            PutOutcome::Inserted(record) | PutOutcome::Existing(record) => record,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, PutOutcome::Inserted(_))
    }
}

/// Keyset position inside the `(received_at, sequence)` ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCursor {
    pub received_at: DateTime<Utc>,
    pub sequence: i64,
}

impl From<&CommandRecord> for PendingCursor {
    fn from(record: &CommandRecord) -> Self {
        Self {
            received_at: record.command.received_at,
            sequence: record.sequence,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandStorePort: Send + Sync {
    /// Insert if `id` is absent, otherwise return the existing record untouched.
    async fn put(&self, command: Command) -> Result<PutOutcome, StoreError>;

    async fn get(&self, id: &CommandId) -> Result<Option<CommandRecord>, StoreError>;

    /// Compare-and-swap transition; fails with `InvalidTransition` when the
    /// table forbids it or a concurrent writer got there first.
    async fn update_state(
        &self,
        id: &CommandId,
        update: StateUpdate,
    ) -> Result<CommandRecord, StoreError>;

    /// One page of `Pending`/`Executing` commands after `after`, ordered by
    /// `(received_at, sequence)`.
    async fn list_pending_page(
        &self,
        player: Option<PlayerId>,
        after: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<CommandRecord>, StoreError>;

    /// `Executed` commands plus `Failed` commands whose failure was not yet confirmed.
    async fn list_unreported(&self) -> Result<Vec<CommandRecord>, StoreError>;

    /// The remote confirmed the outcome. Idempotent for already-reported commands.
    async fn mark_reported(&self, id: &CommandId) -> Result<CommandRecord, StoreError>;

    /// Startup recovery: every `Executing` command goes back to `Pending`.
    async fn recover_executing(&self) -> Result<usize, StoreError>;

    /// Remove reported terminal commands acknowledged before `older_than`.
    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError>;

    async fn close(&self);
}

const DEFAULT_PAGE_SIZE: usize = 64;

/// Lazy, restartable walk over pending commands.
///
/// Pages are fetched on demand, so rows inserted behind the cursor are skipped
/// until [`PendingScan::restart`] is called.
pub struct PendingScan {
    store: Arc<dyn CommandStorePort>,
    player: Option<PlayerId>,
    page_size: usize,
    cursor: Option<PendingCursor>,
    buffer: VecDeque<CommandRecord>,
    exhausted: bool,
}

impl PendingScan {
    pub fn new(store: Arc<dyn CommandStorePort>, player: Option<PlayerId>) -> Self {
        Self {
            store,
            player,
            page_size: DEFAULT_PAGE_SIZE,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn next(&mut self) -> Result<Option<CommandRecord>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .list_pending_page(self.player.clone(), self.cursor.clone(), self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.cursor = Some(PendingCursor::from(last));
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Start over from the oldest pending command.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.buffer.clear();
        self.exhausted = false;
    }

    pub async fn collect_all(mut self) -> Result<Vec<CommandRecord>, StoreError> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}
