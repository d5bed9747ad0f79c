//! Message types exchanged with the remote commerce service
//!
//! One JSON object per frame, discriminated by an internal `type` tag.
//!
//! ## Versioning Policy
//!
//! - New variants can be added at the end (forward compatible)
//! - Renaming variants or tags is a breaking change and bumps [`PROTOCOL_VERSION`]
//! - Unknown server message types deserialize to `Unknown`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use storesync_domain::{AckOutcome, Command, CommandId, PlayerId};

/// Sent with `Authenticate`; the remote refuses sessions it cannot speak to.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Client Messages (engine -> remote)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First frame of every session. The identity must stay stable across
    /// reconnects so the remote can re-deliver unacknowledged commands.
    #[serde(rename = "auth")]
    Authenticate {
        server_identity: String,
        token: String,
        protocol_version: u32,
    },
    #[serde(rename = "heartbeat")]
    Heartbeat { sent_at_ms: i64 },
    /// Receipt for an admitted (or already pending) command; not a completion ack.
    #[serde(rename = "command.received")]
    CommandReceived { id: CommandId },
    #[serde(rename = "command.ack")]
    CommandAck {
        id: CommandId,
        outcome: AckOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// Orderly close
    #[serde(rename = "goodbye")]
    Goodbye,
}

// =============================================================================
// Server Messages (remote -> engine)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth.accepted")]
    AuthAccepted { session_id: String },
    #[serde(rename = "auth.rejected")]
    AuthRejected { reason: String },
    #[serde(rename = "heartbeat.ack")]
    HeartbeatAck { sent_at_ms: i64 },
    #[serde(rename = "command.issued")]
    CommandIssued(CommandIssued),
    /// Backlog replayed by the remote right after authentication
    #[serde(rename = "command.batch")]
    CommandBatch { commands: Vec<CommandIssued> },
    /// The remote stored our acknowledgment for this id
    #[serde(rename = "command.ack_received")]
    AckReceived { id: CommandId },
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Session plumbing handled inside the connection layer rather than by listeners.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ServerMessage::AuthAccepted { .. }
                | ServerMessage::AuthRejected { .. }
                | ServerMessage::HeartbeatAck { .. }
        )
    }
}

/// Payload of `command.issued`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandIssued {
    pub id: CommandId,
    pub player: PlayerId,
    pub payload: String,
    #[serde(default = "default_true")]
    pub requires_online_player: bool,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

impl CommandIssued {
    /// Stamp the local receipt time.
    pub fn into_command(self, received_at: DateTime<Utc>) -> Command {
        Command {
            id: self.id,
            player: self.player,
            payload: self.payload,
            requires_online_player: self.requires_online_player,
            priority: self.priority,
            received_at,
        }
    }
}
