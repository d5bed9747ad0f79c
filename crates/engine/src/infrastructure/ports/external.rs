//! External service ports: the host game runtime and the remote transport.

use async_trait::async_trait;
use storesync_domain::{CommandId, PlayerId};
use storesync_shared::{ClientMessage, ServerMessage};
use tokio::sync::{broadcast, mpsc};

use super::error::{ConnectionError, ExecutionError};

// =============================================================================
// Host Runtime Port
// =============================================================================

/// What the host runtime needs to run one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub command_id: CommandId,
    pub player: PlayerId,
    pub payload: String,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Capability interface implemented once per host flavor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Whether the player is connected to *this* server process.
    fn is_player_online(&self, player: &PlayerId) -> bool;

    /// Hand the command to the runtime's main execution context and wait for
    /// it to finish there. The engine never runs game actions itself.
    async fn run_on_main_context(&self, request: ExecutionRequest) -> Result<(), ExecutionError>;

    /// Player-connect notifications, used to drain pending queues.
    fn subscribe_player_connect(&self) -> broadcast::Receiver<PlayerId>;
}

// =============================================================================
// Transport Port
// =============================================================================

/// One duplex session with the remote service. Dropping `outbound` closes the
/// write side; `inbound` yields `None` once the remote side is gone.
pub struct TransportChannel {
    pub outbound: mpsc::Sender<ClientMessage>,
    pub inbound: mpsc::Receiver<Result<ServerMessage, ConnectionError>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self) -> Result<TransportChannel, ConnectionError>;
}

/// Outbound half of the live session, as seen by components that only send.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Fails with `NotConnected` when there is no authenticated session.
    async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError>;

    fn is_live(&self) -> bool;
}
