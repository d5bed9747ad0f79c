//! Sync coordinator - wires the pipeline together and owns the engine lifecycle.
//!
//! ```text
//! Stopped -> Starting -> Running -> Draining -> Stopped
//! ```
//!
//! `Starting` re-queues executions interrupted by a crash, then brings up the
//! reporter, the scheduler and the inbound router before opening the session.
//! `Draining` closes admission, waits (bounded) for running executions, flushes
//! acknowledgments, then closes the session and the store.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use storesync_domain::{AckOutcome, CommandId, PlayerId};
use storesync_shared::{ClientMessage, CommandIssued, ServerMessage};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionSettings, Credentials, SessionEvent};
use crate::infrastructure::ports::{ClockPort, CommandStorePort, HostRuntime, Transport};
use crate::use_cases::{
    AckReport, AckReporter, Admission, AdmissionError, AdmissionFilter, AdmissionResult,
    ExecutionScheduler, ReporterHandle, SchedulerSettings,
};
use crate::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Draining,
}

impl EngineState {
    pub fn to_u8(self) -> u8 {
        match self {
            EngineState::Stopped => 0,
            EngineState::Starting => 1,
            EngineState::Running => 2,
            EngineState::Draining => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => EngineState::Starting,
            2 => EngineState::Running,
            3 => EngineState::Draining,
            _ => EngineState::Stopped,
        }
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Stopped => "stopped",
            EngineState::Starting => "starting",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
        })
    }
}

/// Components that only exist while the engine is up.
struct Components {
    admission: Arc<AdmissionFilter>,
    scheduler: ExecutionScheduler,
    reporter: ReporterHandle,
    /// Router, purge and session watcher
    tasks: JoinSet<()>,
    tasks_cancel: CancellationToken,
    reporter_task: tokio::task::JoinHandle<()>,
    reporter_cancel: CancellationToken,
}

pub struct SyncCoordinator {
    config: EngineConfig,
    store: Arc<dyn CommandStorePort>,
    host: Arc<dyn HostRuntime>,
    clock: Arc<dyn ClockPort>,
    connection: Arc<ConnectionManager>,
    state: AtomicU8,
    components: Mutex<Option<Components>>,
}

impl SyncCoordinator {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn CommandStorePort>,
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostRuntime>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        let credentials = Credentials::new(config.server_identity.clone(), config.auth_token.clone());
        let connection = Arc::new(ConnectionManager::new(
            transport,
            credentials,
            ConnectionSettings::from(&config),
        ));
        Self {
            config,
            store,
            host,
            clock,
            connection,
            state: AtomicU8::new(EngineState::Stopped.to_u8()),
            components: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    fn set_state(&self, state: EngineState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: EngineState, to: EngineState) -> Result<(), EngineError> {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| EngineError::InvalidLifecycle {
                expected: from,
                actual: EngineState::from_u8(actual),
            })
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        self.transition(EngineState::Stopped, EngineState::Starting)?;
        tracing::info!(endpoint = %self.config.endpoint, "Starting sync engine");

        match self.boot().await {
            Ok(components) => {
                *self.components.lock().await = Some(components);
                self.set_state(EngineState::Running);
                tracing::info!("Sync engine running");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Sync engine failed to start");
                self.set_state(EngineState::Stopped);
                Err(e)
            }
        }
    }

    async fn boot(&self) -> Result<Components, EngineError> {
        self.config.validate()?;

        let recovered = self.store.recover_executing().await?;
        if recovered > 0 {
            tracing::warn!(recovered, "Re-queued executions interrupted by the last shutdown");
        }

        // Subscribe before connecting so nothing from the first session is missed
        let events = self.connection.subscribe_events();
        let watcher_events = self.connection.subscribe_events();
        let messages = self.connection.subscribe_messages().await;

        let (reporter, reporter_handle) = AckReporter::new(
            Arc::clone(&self.store),
            self.connection.clone(),
            events,
            self.config.ack_resend_interval(),
        );
        let reporter_cancel = CancellationToken::new();
        let reporter_task = tokio::spawn(reporter.run(reporter_cancel.clone()));

        let scheduler = ExecutionScheduler::new(
            Arc::clone(&self.store),
            Arc::clone(&self.host),
            reporter_handle.clone(),
            Arc::clone(&self.clock),
            SchedulerSettings::from(&self.config),
        );
        scheduler.start();

        let admission = Arc::new(AdmissionFilter::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        ));

        let tasks_cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let router = InboundRouter {
            admission: Arc::clone(&admission),
            scheduler: scheduler.clone(),
            reporter: reporter_handle.clone(),
            connection: Arc::clone(&self.connection),
        };
        tasks.spawn(router.run(messages, tasks_cancel.clone()));
        tasks.spawn(purge_loop(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.config.clone(),
            tasks_cancel.clone(),
        ));
        tasks.spawn(watch_session(
            watcher_events,
            scheduler.clone(),
            tasks_cancel.clone(),
        ));

        let components = Components {
            admission,
            scheduler,
            reporter: reporter_handle,
            tasks,
            tasks_cancel,
            reporter_task,
            reporter_cancel,
        };

        if let Err(e) = self.connection.connect().await {
            self.stop_components(components, false).await;
            return Err(e.into());
        }
        Ok(components)
    }

    /// Replace the credentials and restart the session loop, e.g. after the
    /// remote rejected the old ones.
    pub async fn rotate_credentials(&self, credentials: Credentials) -> Result<(), EngineError> {
        let state = self.state();
        if state != EngineState::Running {
            return Err(EngineError::InvalidLifecycle {
                expected: EngineState::Running,
                actual: state,
            });
        }
        self.connection.update_credentials(credentials).await;
        self.connection.connect().await?;
        tracing::info!("Credentials rotated, reconnecting");
        Ok(())
    }

    /// Commands parked until `player` connects, in execution order.
    pub async fn parked_for(&self, player: &PlayerId) -> Vec<CommandId> {
        let scheduler = self
            .components
            .lock()
            .await
            .as_ref()
            .map(|components| components.scheduler.clone());
        match scheduler {
            Some(scheduler) => scheduler.parked_for(player).await,
            None => Vec::new(),
        }
    }

    /// Acknowledgments sent (or waiting to be sent) but not yet confirmed.
    pub async fn outstanding_acks(&self) -> usize {
        self.components
            .lock()
            .await
            .as_ref()
            .map_or(0, |components| components.reporter.outstanding())
    }

    /// Drain and stop. The store stays open so the engine can be started
    /// again; closing it is up to whoever opened it.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.transition(EngineState::Running, EngineState::Draining)?;
        tracing::info!("Draining sync engine");

        let components = self.components.lock().await.take();
        if let Some(components) = components {
            self.stop_components(components, true).await;
        }
        self.set_state(EngineState::Stopped);
        tracing::info!("Sync engine stopped");
        Ok(())
    }

    async fn stop_components(&self, mut components: Components, flush: bool) {
        components.admission.close();

        let drain_timeout = self.config.drain_timeout();
        components.scheduler.shutdown(drain_timeout).await;

        // The router stays up here so confirmations still reach the reporter
        if flush {
            if self.connection.status().is_live() {
                if let Err(e) = components.reporter.flush(drain_timeout).await {
                    tracing::warn!(error = %e, "Acknowledgments stay persisted for the next start");
                }
            } else if components.reporter.outstanding() > 0 {
                tracing::warn!(
                    outstanding = components.reporter.outstanding(),
                    "Session down during drain; acknowledgments stay persisted for the next start"
                );
            }
        }

        self.connection.stop().await;

        components.tasks_cancel.cancel();
        while let Some(result) = components.tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Coordinator task panicked");
            }
        }
        components.reporter_cancel.cancel();
        if let Err(e) = components.reporter_task.await {
            tracing::error!(error = %e, "Reporter task panicked");
        }
    }
}

/// Routes inbound non-control messages through admission to the scheduler
/// and the reporter.
struct InboundRouter {
    admission: Arc<AdmissionFilter>,
    scheduler: ExecutionScheduler,
    reporter: ReporterHandle,
    connection: Arc<ConnectionManager>,
}

impl InboundRouter {
    async fn run(self, mut messages: mpsc::UnboundedReceiver<ServerMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = messages.recv() => match message {
                    Some(message) => self.route(message).await,
                    None => break,
                },
            }
        }
    }

    async fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::CommandIssued(issued) => self.on_issued(issued).await,
            ServerMessage::CommandBatch { commands } => {
                tracing::debug!(count = commands.len(), "Received command backlog");
                for issued in commands {
                    self.on_issued(issued).await;
                }
            }
            ServerMessage::AckReceived { id } => self.reporter.confirm(id),
            ServerMessage::Unknown => tracing::debug!("Ignoring unknown server message"),
            other => tracing::trace!(message = ?other, "Ignoring control message"),
        }
    }

    async fn on_issued(&self, issued: CommandIssued) {
        let id = issued.id.clone();
        match self.admission.admit(issued).await {
            Ok(Admission {
                result: AdmissionResult::New | AdmissionResult::DuplicatePending,
                record,
            }) => {
                self.send(ClientMessage::CommandReceived { id }).await;
                self.scheduler.submit(record).await;
            }
            Ok(Admission {
                result: AdmissionResult::DuplicateIgnored,
                record,
            }) => {
                if let Some(report) = AckReport::from_record(&record) {
                    self.reporter.resend(report);
                }
            }
            Err(AdmissionError::Closed) => {
                tracing::debug!(command_id = %id, "Draining, delivery left for the remote to repeat");
            }
            Err(AdmissionError::Invalid(reason)) => {
                tracing::warn!(command_id = %id, reason = %reason, "Refusing invalid command");
                if !id.is_blank() {
                    self.send(ClientMessage::CommandAck {
                        id,
                        outcome: AckOutcome::Failure,
                        detail: Some(reason),
                    })
                    .await;
                }
            }
            Err(AdmissionError::Store(e)) => {
                tracing::error!(command_id = %id, error = %e, "Failed to persist command");
            }
        }
    }

    async fn send(&self, message: ClientMessage) {
        if let Err(e) = self.connection.send(message).await {
            tracing::debug!(error = %e, "Could not send to remote");
        }
    }
}

/// Drop reported commands once they are older than the retention window.
async fn purge_loop(
    store: Arc<dyn CommandStorePort>,
    clock: Arc<dyn ClockPort>,
    config: EngineConfig,
    cancel: CancellationToken,
) {
    let period = config.purge_interval();
    let retention = config.retention_window();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let cutoff = clock.window_start(retention);
                match store.purge_acknowledged(cutoff).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!(purged, "Purged acknowledged commands"),
                    Err(e) => tracing::warn!(error = %e, "Purge failed"),
                }
            }
        }
    }
}

/// Surface session changes that need a reaction outside the connection layer.
async fn watch_session(
    mut events: broadcast::Receiver<SessionEvent>,
    scheduler: ExecutionScheduler,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::Ready { generation }) => {
                tracing::info!(generation, "Session ready");
                scheduler.nudge();
            }
            Ok(SessionEvent::AuthFailed { reason }) => {
                tracing::error!(
                    reason = %reason,
                    "Remote rejected the credentials; the engine stays disconnected until they are rotated"
                );
            }
            Ok(SessionEvent::Lost { reason }) => {
                tracing::warn!(reason = %reason, "Session lost, reconnecting");
            }
            Ok(SessionEvent::Degraded) | Ok(SessionEvent::Recovered) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
