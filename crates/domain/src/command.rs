//! Commands issued by the remote storefront and their local lifecycle.
//!
//! A command moves through a small state machine:
//!
//! ```text
//! Pending ──► Executing ──► Executed ──► Acknowledged
//!    │  ▲          │
//!    │  └──────────┤ (transient failure / crash recovery)
//!    ▼             ▼
//!  Failed ◄────────┘
//! ```
//!
//! `Acknowledged` and `Failed` are terminal. A `Failed` command is still reported
//! upstream; once the remote confirms it, `acknowledged_at` is stamped but the
//! state stays `Failed`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::ids::{CommandId, PlayerId};

/// A unit of work requested by the remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub player: PlayerId,
    /// Literal instruction handed to the host runtime (usually a console command line)
    pub payload: String,
    pub requires_online_player: bool,
    /// Higher runs first within a player's pending queue
    #[serde(default)]
    pub priority: i32,
    /// First local receipt
    pub received_at: DateTime<Utc>,
}

impl Command {
    pub fn new(
        id: impl Into<CommandId>,
        player: impl Into<PlayerId>,
        payload: impl Into<String>,
        requires_online_player: bool,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            player: player.into(),
            payload: payload.into(),
            requires_online_player,
            priority: 0,
            received_at,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Checks the identity fields. A blank payload is accepted here and rejected
    /// at execution time so that it still produces a failure acknowledgment.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.id.is_blank() {
            return Err(DomainError::validation("command id cannot be empty"));
        }
        if self.player.is_blank() {
            return Err(DomainError::validation(format!(
                "command {} has no target player",
                self.id
            )));
        }
        Ok(())
    }

    /// Reason the payload can never execute, if any.
    pub fn payload_rejection(&self) -> Option<String> {
        if self.payload.trim().is_empty() {
            Some("payload is empty".to_string())
        } else {
            None
        }
    }
}

/// Lifecycle state of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    Pending,
    Executing,
    Executed,
    Failed,
    Acknowledged,
}

impl CommandState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandState::Pending => "pending",
            CommandState::Executing => "executing",
            CommandState::Executed => "executed",
            CommandState::Failed => "failed",
            CommandState::Acknowledged => "acknowledged",
        }
    }

    /// Legal transition table.
    pub fn can_transition_to(self, next: CommandState) -> bool {
        use CommandState::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Failed)
                | (Executing, Executed)
                | (Executing, Pending)
                | (Executing, Failed)
                | (Executed, Acknowledged)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CommandState::Acknowledged | CommandState::Failed)
    }

    /// Still waiting to run (or running right now).
    pub fn is_active(self) -> bool {
        matches!(self, CommandState::Pending | CommandState::Executing)
    }

    /// Outcome to report upstream, for states that have one.
    pub fn outcome(self) -> Option<AckOutcome> {
        match self {
            CommandState::Executed | CommandState::Acknowledged => Some(AckOutcome::Success),
            CommandState::Failed => Some(AckOutcome::Failure),
            CommandState::Pending | CommandState::Executing => None,
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandState::Pending),
            "executing" => Ok(CommandState::Executing),
            "executed" => Ok(CommandState::Executed),
            "failed" => Ok(CommandState::Failed),
            "acknowledged" => Ok(CommandState::Acknowledged),
            other => Err(DomainError::validation(format!(
                "unknown command state '{other}'"
            ))),
        }
    }
}

/// Outcome carried by an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    Success,
    Failure,
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckOutcome::Success => f.write_str("success"),
            AckOutcome::Failure => f.write_str("failure"),
        }
    }
}

/// A requested state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub to: CommandState,
    pub detail: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
}

impl StateUpdate {
    pub fn to(state: CommandState) -> Self {
        Self {
            to: state,
            detail: None,
            not_before: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Only meaningful when moving back to `Pending`.
    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = Some(at);
        self
    }
}

/// Persisted view of a command plus its execution bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: Command,
    /// Local insertion order, used to break `received_at` ties
    pub sequence: i64,
    pub state: CommandState,
    /// Number of times the command was claimed into `Executing`
    pub attempts: u32,
    /// Earliest time a retry may start
    pub not_before: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    /// Bumped on every write; stores use it for compare-and-swap
    pub revision: i64,
}

impl CommandRecord {
    pub fn new(command: Command, sequence: i64) -> Self {
        let updated_at = command.received_at;
        Self {
            command,
            sequence,
            state: CommandState::Pending,
            attempts: 0,
            not_before: None,
            last_error: None,
            updated_at,
            completed_at: None,
            acknowledged_at: None,
            revision: 0,
        }
    }

    pub fn id(&self) -> &CommandId {
        &self.command.id
    }

    pub fn player(&self) -> &PlayerId {
        &self.command.player
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    pub fn outcome(&self) -> Option<AckOutcome> {
        self.state.outcome()
    }

    /// The remote has confirmed the terminal outcome.
    pub fn is_reported(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Still needs an acknowledgment delivered upstream.
    pub fn needs_report(&self) -> bool {
        match self.state {
            CommandState::Executed => true,
            CommandState::Failed => !self.is_reported(),
            _ => false,
        }
    }

    /// Apply a transition, rejecting anything outside the table.
    pub fn apply(&mut self, update: &StateUpdate, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.state.can_transition_to(update.to) {
            return Err(DomainError::invalid_transition(self.state, update.to));
        }

        match update.to {
            CommandState::Executing => {
                self.attempts += 1;
                self.not_before = None;
            }
            CommandState::Pending => {
                self.not_before = update.not_before;
            }
            CommandState::Executed | CommandState::Failed => {
                self.completed_at = Some(now);
            }
            CommandState::Acknowledged => {
                self.acknowledged_at = Some(now);
            }
        }

        if let Some(detail) = &update.detail {
            self.last_error = Some(detail.clone());
        }
        self.state = update.to;
        self.updated_at = now;
        self.revision += 1;
        Ok(())
    }

    /// Record upstream confirmation. Returns `false` when it was already recorded.
    pub fn mark_reported(&mut self, now: DateTime<Utc>) -> Result<bool, DomainError> {
        match self.state {
            CommandState::Executed => {
                self.apply(&StateUpdate::to(CommandState::Acknowledged), now)?;
                Ok(true)
            }
            CommandState::Failed if self.acknowledged_at.is_none() => {
                self.acknowledged_at = Some(now);
                self.updated_at = now;
                self.revision += 1;
                Ok(true)
            }
            CommandState::Failed | CommandState::Acknowledged => Ok(false),
            state => Err(DomainError::invalid_transition(
                state,
                CommandState::Acknowledged,
            )),
        }
    }
}
