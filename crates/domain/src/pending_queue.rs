//! Per-player holding area for commands that wait on the player being online.

use chrono::{DateTime, Utc};

use crate::command::CommandRecord;
use crate::ids::{CommandId, PlayerId};

/// Ordering key of a parked command. The queue only holds ids; the command
/// store stays the authority for everything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub id: CommandId,
    pub priority: i32,
    pub received_at: DateTime<Utc>,
    pub sequence: i64,
}

impl QueuedCommand {
    fn runs_before(&self, other: &QueuedCommand) -> bool {
        (std::cmp::Reverse(self.priority), self.received_at, self.sequence)
            < (std::cmp::Reverse(other.priority), other.received_at, other.sequence)
    }
}

impl From<&CommandRecord> for QueuedCommand {
    fn from(record: &CommandRecord) -> Self {
        Self {
            id: record.command.id.clone(),
            priority: record.command.priority,
            received_at: record.command.received_at,
            sequence: record.sequence,
        }
    }
}

/// Ordered by priority (highest first), then `received_at`, then local sequence.
#[derive(Debug, Clone)]
pub struct PendingQueue {
    player: PlayerId,
    entries: Vec<QueuedCommand>,
}

impl PendingQueue {
    pub fn new(player: PlayerId) -> Self {
        Self {
            player,
            entries: Vec::new(),
        }
    }

    pub fn player(&self) -> &PlayerId {
        &self.player
    }

    /// Insert in order. Returns `false` if the id is already queued.
    pub fn push(&mut self, entry: QueuedCommand) -> bool {
        if self.contains(&entry.id) {
            return false;
        }
        let idx = self
            .entries
            .partition_point(|existing| existing.runs_before(&entry) || *existing == entry);
        self.entries.insert(idx, entry);
        true
    }

    pub fn contains(&self, id: &CommandId) -> bool {
        self.entries.iter().any(|entry| &entry.id == id)
    }

    pub fn remove(&mut self, id: &CommandId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| &entry.id != id);
        self.entries.len() != before
    }

    pub fn pop_front(&mut self) -> Option<QueuedCommand> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedCommand> {
        self.entries.iter()
    }

    /// Consume the queue, yielding ids in execution order.
    pub fn into_ids(self) -> Vec<CommandId> {
        self.entries.into_iter().map(|entry| entry.id).collect()
    }
}
