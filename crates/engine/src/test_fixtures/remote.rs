//! Scripted stand-in for the remote commerce service.
//!
//! [`MemoryTransport`] hands the connection manager an in-memory duplex
//! channel; every opened session is served by a task that answers the
//! handshake and heartbeats, records what the engine sent, and (by default)
//! confirms every acknowledgment it receives.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use storesync_domain::{AckOutcome, CommandId};
use storesync_shared::{ClientMessage, CommandIssued, ServerMessage};
use tokio::sync::mpsc;

use crate::infrastructure::ports::{ConnectionError, Transport, TransportChannel};

type Inbound = mpsc::Sender<Result<ServerMessage, ConnectionError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAck {
    pub id: CommandId,
    pub outcome: AckOutcome,
    pub detail: Option<String>,
}

struct RemoteState {
    sessions_opened: u64,
    current: Option<(u64, Inbound)>,
    reject_auth: Option<String>,
    refuse_connections: bool,
    answer_heartbeats: bool,
    auto_confirm: bool,
    auth_identities: Vec<String>,
    receipts: Vec<CommandId>,
    acks: Vec<ReceivedAck>,
    heartbeats: usize,
    goodbyes: usize,
}

#[derive(Clone)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for FakeRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                sessions_opened: 0,
                current: None,
                reject_auth: None,
                refuse_connections: false,
                answer_heartbeats: true,
                auto_confirm: true,
                auth_identities: Vec::new(),
                receipts: Vec::new(),
                acks: Vec::new(),
                heartbeats: 0,
                goodbyes: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().expect("remote state lock")
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(MemoryTransport {
            remote: self.clone(),
        })
    }

    pub fn reject_auth(&self, reason: &str) {
        self.lock().reject_auth = Some(reason.to_string());
    }

    pub fn accept_auth(&self) {
        self.lock().reject_auth = None;
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    pub fn set_answer_heartbeats(&self, answer: bool) {
        self.lock().answer_heartbeats = answer;
    }

    pub fn set_auto_confirm(&self, confirm: bool) {
        self.lock().auto_confirm = confirm;
    }

    /// Push a frame into the live session. `false` when there is none.
    pub async fn push(&self, message: ServerMessage) -> bool {
        let sender = self.lock().current.as_ref().map(|(_, tx)| tx.clone());
        match sender {
            Some(tx) => tx.send(Ok(message)).await.is_ok(),
            None => false,
        }
    }

    pub async fn issue(&self, issued: CommandIssued) -> bool {
        self.push(ServerMessage::CommandIssued(issued)).await
    }

    pub async fn confirm(&self, id: &CommandId) -> bool {
        self.push(ServerMessage::AckReceived { id: id.clone() }).await
    }

    /// Sever the live session as a network failure would.
    pub fn drop_session(&self) {
        self.lock().current = None;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn sessions_opened(&self) -> u64 {
        self.lock().sessions_opened
    }

    pub fn auth_identities(&self) -> Vec<String> {
        self.lock().auth_identities.clone()
    }

    pub fn receipts(&self) -> Vec<CommandId> {
        self.lock().receipts.clone()
    }

    pub fn acks(&self) -> Vec<ReceivedAck> {
        self.lock().acks.clone()
    }

    pub fn acks_for(&self, id: &str) -> Vec<ReceivedAck> {
        self.lock()
            .acks
            .iter()
            .filter(|ack| ack.id.as_str() == id)
            .cloned()
            .collect()
    }

    pub fn heartbeats(&self) -> usize {
        self.lock().heartbeats
    }

    pub fn goodbyes(&self) -> usize {
        self.lock().goodbyes
    }

    /// Record a client frame and decide the replies, if this session is still current.
    fn handle(&self, session: u64, message: ClientMessage) -> Option<(Inbound, Vec<ServerMessage>)> {
        let mut state = self.lock();
        let sender = match &state.current {
            Some((current, tx)) if *current == session => tx.clone(),
            _ => return None,
        };

        let mut replies = Vec::new();
        match message {
            ClientMessage::Authenticate {
                server_identity, ..
            } => {
                state.auth_identities.push(server_identity);
                match &state.reject_auth {
                    Some(reason) => replies.push(ServerMessage::AuthRejected {
                        reason: reason.clone(),
                    }),
                    None => replies.push(ServerMessage::AuthAccepted {
                        session_id: format!("session-{session}"),
                    }),
                }
            }
            ClientMessage::Heartbeat { sent_at_ms } => {
                state.heartbeats += 1;
                if state.answer_heartbeats {
                    replies.push(ServerMessage::HeartbeatAck { sent_at_ms });
                }
            }
            ClientMessage::CommandReceived { id } => state.receipts.push(id),
            ClientMessage::CommandAck {
                id,
                outcome,
                detail,
            } => {
                if state.auto_confirm {
                    replies.push(ServerMessage::AckReceived { id: id.clone() });
                }
                state.acks.push(ReceivedAck {
                    id,
                    outcome,
                    detail,
                });
            }
            ClientMessage::Goodbye => state.goodbyes += 1,
        }
        Some((sender, replies))
    }
}

pub struct MemoryTransport {
    remote: FakeRemote,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self) -> Result<TransportChannel, ConnectionError> {
        let (outbound, mut from_client) = mpsc::channel::<ClientMessage>(64);
        let (to_client, inbound) = mpsc::channel(64);

        let session = {
            let mut state = self.remote.lock();
            if state.refuse_connections {
                return Err(ConnectionError::network("connection refused"));
            }
            state.sessions_opened += 1;
            let session = state.sessions_opened;
            state.current = Some((session, to_client));
            session
        };

        let remote = self.remote.clone();
        tokio::spawn(async move {
            while let Some(message) = from_client.recv().await {
                let Some((sender, replies)) = remote.handle(session, message) else {
                    break;
                };
                for reply in replies {
                    if sender.send(Ok(reply)).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(TransportChannel { outbound, inbound })
    }
}
