//! Session lifecycle with the remote commerce service.
//!
//! One background loop per manager owns the live [`TransportChannel`]: it
//! authenticates, pumps inbound frames to listeners in receipt order, sends
//! heartbeats, and reconnects with backoff when the session is lost. Other
//! components only observe it through [`SessionEvent`]s and the
//! [`MessageSink`] surface.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use storesync_shared::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backoff::BackoffState;
use crate::config::{BackoffConfig, EngineConfig};
use crate::infrastructure::ports::{ConnectionError, MessageSink, Transport, TransportChannel};

/// Observable status of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Authenticated,
    /// Connected, but the remote has been silent for at least one heartbeat interval
    Degraded,
}

impl SessionStatus {
    /// Convert to u8 for atomic storage.
    pub fn to_u8(self) -> u8 {
        match self {
            SessionStatus::Disconnected => 0,
            SessionStatus::Connecting => 1,
            SessionStatus::Authenticated => 2,
            SessionStatus::Degraded => 3,
        }
    }

    /// Convert from u8 (atomic storage).
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionStatus::Connecting,
            2 => SessionStatus::Authenticated,
            3 => SessionStatus::Degraded,
            _ => SessionStatus::Disconnected,
        }
    }

    /// Messages can be sent in this state.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Authenticated | SessionStatus::Degraded)
    }
}

/// Lifecycle events published on the session bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new authenticated session; `generation` increments per session
    Ready { generation: u64 },
    Degraded,
    Recovered,
    Lost { reason: String },
    /// Credentials were refused. The manager stops retrying.
    AuthFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub server_identity: String,
    pub token: String,
}

impl Credentials {
    pub fn new(server_identity: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_identity: server_identity.into(),
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub handshake_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl From<&EngineConfig> for ConnectionSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            max_missed_heartbeats: config.max_missed_heartbeats,
            handshake_timeout: config.handshake_timeout(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Why a live session ended.
enum SessionEnd {
    Stopped,
    Lost(String),
    Rejected(String),
}

struct Shared {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    credentials: RwLock<Credentials>,
    status: AtomicU8,
    generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ServerMessage>>>,
    outbound: RwLock<Option<mpsc::Sender<ClientMessage>>>,
}

pub struct ConnectionManager {
    shared: Arc<Shared>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Credentials,
        settings: ConnectionSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                transport,
                settings,
                credentials: RwLock::new(credentials),
                status: AtomicU8::new(SessionStatus::Disconnected.to_u8()),
                generation: AtomicU64::new(0),
                events,
                listeners: Mutex::new(Vec::new()),
                outbound: RwLock::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Number of sessions authenticated so far.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Register a listener for inbound non-control messages, delivered in
    /// receipt order.
    pub async fn subscribe_messages(&self) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.listeners.lock().await.push(tx);
        rx
    }

    /// Rotate credentials. Takes effect on the next handshake.
    pub async fn update_credentials(&self, credentials: Credentials) {
        *self.shared.credentials.write().await = credentials;
    }

    /// Start the session loop. A no-op while a loop is already running.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        {
            let credentials = self.shared.credentials.read().await;
            if credentials.server_identity.trim().is_empty() || credentials.token.trim().is_empty()
            {
                return Err(ConnectionError::Auth(
                    "server identity and token are required".to_string(),
                ));
            }
        }

        let mut task = self.task.lock().await;
        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                tracing::debug!("Connection loop already running");
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(run_connection_loop(shared, cancel.clone()));
        *task = Some((cancel, handle));
        Ok(())
    }

    /// Fails with `NotConnected` unless a session is authenticated.
    pub async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        if !self.status().is_live() {
            return Err(ConnectionError::NotConnected);
        }
        // Clone the sender to avoid holding the lock across await
        let outbound = self.shared.outbound.read().await.clone();
        match outbound {
            Some(tx) => tx
                .send(message)
                .await
                .map_err(|_| ConnectionError::NotConnected),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Say goodbye, stop the loop, and stay `Disconnected`.
    pub async fn stop(&self) {
        if self.send(ClientMessage::Goodbye).await.is_ok() {
            tracing::debug!("Sent goodbye to remote service");
        }

        let task = self.task.lock().await.take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Connection loop panicked");
            }
        }
        self.shared.outbound.write().await.take();
        self.shared.set_status(SessionStatus::Disconnected);
        tracing::info!("Connection manager stopped");
    }
}

#[async_trait]
impl MessageSink for ConnectionManager {
    async fn send(&self, message: ClientMessage) -> Result<(), ConnectionError> {
        ConnectionManager::send(self, message).await
    }

    fn is_live(&self) -> bool {
        self.status().is_live()
    }
}

impl Shared {
    fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    fn publish(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Open the transport and authenticate, both bounded by the handshake timeout.
    async fn establish(&self, credentials: &Credentials) -> Result<TransportChannel, ConnectionError> {
        let timeout = self.settings.handshake_timeout;

        let mut channel = tokio::time::timeout(timeout, self.transport.open())
            .await
            .map_err(|_| ConnectionError::Timeout("connect"))??;

        channel
            .outbound
            .send(ClientMessage::Authenticate {
                server_identity: credentials.server_identity.clone(),
                token: credentials.token.clone(),
                protocol_version: PROTOCOL_VERSION,
            })
            .await
            .map_err(|_| ConnectionError::network("transport closed during handshake"))?;

        let session_id = tokio::time::timeout(timeout, async {
            loop {
                match channel.inbound.recv().await {
                    Some(Ok(ServerMessage::AuthAccepted { session_id })) => return Ok(session_id),
                    Some(Ok(ServerMessage::AuthRejected { reason })) => {
                        return Err(ConnectionError::Auth(reason))
                    }
                    Some(Ok(other)) => {
                        tracing::debug!(?other, "Ignoring message received before authentication");
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(ConnectionError::network(
                            "remote closed the connection during handshake",
                        ))
                    }
                }
            }
        })
        .await
        .map_err(|_| ConnectionError::Timeout("authentication"))??;

        tracing::info!(session_id = %session_id, "Authenticated with remote service");
        Ok(channel)
    }

    async fn dispatch(&self, message: ServerMessage) {
        let mut listeners = self.listeners.lock().await;
        listeners.retain(|listener| listener.send(message.clone()).is_ok());
    }

    async fn run_session(&self, mut channel: TransportChannel, cancel: &CancellationToken) -> SessionEnd {
        let interval = self.settings.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The handshake counts as traffic for the first interval
        let mut heard_since_tick = true;
        let mut silent_intervals = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Stopped,

                frame = channel.inbound.recv() => match frame {
                    Some(Ok(message)) => {
                        heard_since_tick = true;
                        silent_intervals = 0;
                        if self.status() == SessionStatus::Degraded {
                            self.set_status(SessionStatus::Authenticated);
                            self.publish(SessionEvent::Recovered);
                            tracing::info!("Remote service responsive again");
                        }

                        match message {
                            ServerMessage::AuthRejected { reason } => return SessionEnd::Rejected(reason),
                            ServerMessage::Unknown => {
                                tracing::debug!("Ignoring unknown message type from remote");
                            }
                            message if message.is_control() => {
                                tracing::trace!(?message, "Control message");
                            }
                            message => self.dispatch(message).await,
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("remote closed the connection".to_string()),
                },

                _ = ticker.tick() => {
                    if heard_since_tick {
                        heard_since_tick = false;
                    } else {
                        silent_intervals += 1;
                    }

                    if silent_intervals >= self.settings.max_missed_heartbeats {
                        return SessionEnd::Lost(format!(
                            "no traffic for {silent_intervals} heartbeat intervals"
                        ));
                    }
                    if silent_intervals > 0 && self.status() == SessionStatus::Authenticated {
                        self.set_status(SessionStatus::Degraded);
                        self.publish(SessionEvent::Degraded);
                        tracing::warn!(silent_intervals, "Remote heartbeat late, session degraded");
                    }

                    let heartbeat = ClientMessage::Heartbeat {
                        sent_at_ms: chrono::Utc::now().timestamp_millis(),
                    };
                    if channel.outbound.send(heartbeat).await.is_err() {
                        return SessionEnd::Lost("transport closed".to_string());
                    }
                }
            }
        }
    }
}

async fn run_connection_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut backoff = BackoffState::new(shared.settings.backoff.clone());

    loop {
        shared.set_status(SessionStatus::Connecting);
        let credentials = shared.credentials.read().await.clone();
        tracing::info!(
            server_identity = %credentials.server_identity,
            attempt = backoff.attempts() + 1,
            "Connecting to remote service"
        );

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = shared.establish(&credentials) => outcome,
        };

        let end = match outcome {
            Ok(channel) => {
                backoff.reset();
                *shared.outbound.write().await = Some(channel.outbound.clone());
                shared.set_status(SessionStatus::Authenticated);
                let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
                shared.publish(SessionEvent::Ready { generation });

                let end = shared.run_session(channel, &cancel).await;
                shared.outbound.write().await.take();
                end
            }
            Err(ConnectionError::Auth(reason)) => SessionEnd::Rejected(reason),
            Err(e) => SessionEnd::Lost(e.to_string()),
        };

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Rejected(reason) => {
                shared.set_status(SessionStatus::Disconnected);
                tracing::error!(
                    reason = %reason,
                    "Remote service rejected credentials; not reconnecting until they are updated"
                );
                shared.publish(SessionEvent::AuthFailed { reason });
                break;
            }
            SessionEnd::Lost(reason) => {
                shared.set_status(SessionStatus::Disconnected);
                tracing::warn!(reason = %reason, "Session with remote service lost");
                shared.publish(SessionEvent::Lost { reason });
            }
        }

        let delay = backoff.next_delay();
        tracing::info!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempts(),
            "Reconnecting after backoff"
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_status(SessionStatus::Disconnected);
    tracing::debug!("Connection loop exited");
}
