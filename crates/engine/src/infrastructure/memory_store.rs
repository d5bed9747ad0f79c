//! In-memory command store for development and testing
//!
//! Same semantics as the SQLite store, minus durability: everything is lost
//! when the process exits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use storesync_domain::{
    Command, CommandId, CommandRecord, CommandState, PlayerId, StateUpdate,
};
use tokio::sync::RwLock;

use crate::infrastructure::ports::{
    ClockPort, CommandStorePort, PendingCursor, PutOutcome, StoreError,
};

#[derive(Default)]
struct Inner {
    records: HashMap<CommandId, CommandRecord>,
    next_sequence: i64,
}

pub struct InMemoryCommandStore {
    inner: RwLock<Inner>,
    clock: Arc<dyn ClockPort>,
}

impl InMemoryCommandStore {
    pub fn new(clock: Arc<dyn ClockPort>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            clock,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CommandStorePort for InMemoryCommandStore {
    async fn put(&self, command: Command) -> Result<PutOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.records.get(&command.id) {
            return Ok(PutOutcome::Existing(existing.clone()));
        }

        inner.next_sequence += 1;
        let record = CommandRecord::new(command, inner.next_sequence);
        inner
            .records
            .insert(record.command.id.clone(), record.clone());
        Ok(PutOutcome::Inserted(record))
    }

    async fn get(&self, id: &CommandId) -> Result<Option<CommandRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(id).cloned())
    }

    async fn update_state(
        &self,
        id: &CommandId,
        update: StateUpdate,
    ) -> Result<CommandRecord, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if let Err(e) = record.apply(&update, now) {
            tracing::warn!(command_id = %id, error = %e, "Rejected command state change");
            return Err(StoreError::from_domain(id, e));
        }
        Ok(record.clone())
    }

    async fn list_pending_page(
        &self,
        player: Option<PlayerId>,
        after: Option<PendingCursor>,
        limit: usize,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut page: Vec<CommandRecord> = inner
            .records
            .values()
            .filter(|record| record.state.is_active())
            .filter(|record| player.as_ref().map_or(true, |p| record.player() == p))
            .filter(|record| {
                after.as_ref().map_or(true, |cursor| {
                    (record.command.received_at, record.sequence)
                        > (cursor.received_at, cursor.sequence)
                })
            })
            .cloned()
            .collect();

        page.sort_by_key(|record| (record.command.received_at, record.sequence));
        page.truncate(limit);
        Ok(page)
    }

    async fn list_unreported(&self) -> Result<Vec<CommandRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<CommandRecord> = inner
            .records
            .values()
            .filter(|record| record.needs_report())
            .cloned()
            .collect();
        records.sort_by_key(|record| (record.command.received_at, record.sequence));
        Ok(records)
    }

    async fn mark_reported(&self, id: &CommandId) -> Result<CommandRecord, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        record
            .mark_reported(now)
            .map_err(|e| StoreError::from_domain(id, e))?;
        Ok(record.clone())
    }

    async fn recover_executing(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.write().await;
        let mut recovered = 0;
        for record in inner.records.values_mut() {
            if record.state == CommandState::Executing {
                record
                    .apply(
                        &StateUpdate::to(CommandState::Pending)
                            .with_detail("interrupted by restart"),
                        now,
                    )
                    .map_err(|e| StoreError::from_domain(&record.command.id, e))?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn purge_acknowledged(&self, older_than: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|_, record| {
            let expired = record.state.is_terminal()
                && record
                    .acknowledged_at
                    .map_or(false, |acked| acked < older_than);
            !expired
        });
        Ok(before - inner.records.len())
    }

    async fn close(&self) {}
}
