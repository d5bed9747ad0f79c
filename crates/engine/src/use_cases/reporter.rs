//! Acknowledgment reporting.
//!
//! Every command that reaches `Executed` or `Failed` owes the remote service
//! an outcome report. The reporter keeps those reports outstanding until the
//! remote confirms them (`AckReceived`), re-sending whenever a new session
//! becomes ready and periodically while unconfirmed. Outstanding reports are
//! rebuilt from the store on startup, so they survive restarts.
//!
//! The reporter never talks to the transport directly: it sends through a
//! [`MessageSink`] and learns about sessions from [`SessionEvent`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use storesync_domain::{AckOutcome, CommandId, CommandRecord};
use storesync_shared::ClientMessage;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::connection::SessionEvent;
use crate::infrastructure::ports::{CommandStorePort, MessageSink};
use crate::EngineError;

/// Outcome report for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReport {
    pub id: CommandId,
    pub outcome: AckOutcome,
    pub detail: Option<String>,
}

impl AckReport {
    /// The report a record owes, if it reached an outcome.
    pub fn from_record(record: &CommandRecord) -> Option<Self> {
        let outcome = record.outcome()?;
        let detail = match outcome {
            AckOutcome::Failure => record.last_error.clone(),
            AckOutcome::Success => None,
        };
        Some(Self {
            id: record.id().clone(),
            outcome,
            detail,
        })
    }

    fn to_message(&self) -> ClientMessage {
        ClientMessage::CommandAck {
            id: self.id.clone(),
            outcome: self.outcome,
            detail: self.detail.clone(),
        }
    }
}

enum ReporterCommand {
    /// Track until confirmed, send now if possible
    Report(AckReport),
    /// Remote stored our ack
    Confirm(CommandId),
    /// Send once more for a duplicate delivery. Never tracked; outstanding
    /// reports are already covered by the resend timer
    Resend(AckReport),
    /// Reply once every earlier command has been processed
    Barrier(oneshot::Sender<()>),
}

/// Cloneable handle used by the scheduler and the inbound router.
#[derive(Clone)]
pub struct ReporterHandle {
    commands: mpsc::UnboundedSender<ReporterCommand>,
    outstanding: watch::Receiver<usize>,
}

impl ReporterHandle {
    pub fn report(&self, report: AckReport) {
        if self.commands.send(ReporterCommand::Report(report)).is_err() {
            tracing::warn!("Reporter stopped; outcome stays in the store for the next start");
        }
    }

    pub fn confirm(&self, id: CommandId) {
        let _ = self.commands.send(ReporterCommand::Confirm(id));
    }

    pub fn resend(&self, report: AckReport) {
        let _ = self.commands.send(ReporterCommand::Resend(report));
    }

    /// Reports still waiting for confirmation.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Wait until every report handed over so far is confirmed.
    pub async fn flush(&self, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;

        let (done, barrier) = oneshot::channel();
        if self.commands.send(ReporterCommand::Barrier(done)).is_err() {
            return Err(EngineError::AckDelivery("reporter is not running".to_string()));
        }
        let _ = tokio::time::timeout_at(deadline, barrier).await;

        let mut outstanding = self.outstanding.clone();
        let drained = tokio::time::timeout_at(deadline, outstanding.wait_for(|n| *n == 0))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        if drained {
            Ok(())
        } else {
            Err(EngineError::AckDelivery(format!(
                "{} acknowledgment(s) still unconfirmed",
                self.outstanding()
            )))
        }
    }
}

pub struct AckReporter {
    store: Arc<dyn CommandStorePort>,
    sink: Arc<dyn MessageSink>,
    events: broadcast::Receiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<ReporterCommand>,
    outstanding: HashMap<CommandId, AckReport>,
    outstanding_tx: watch::Sender<usize>,
    resend_interval: Duration,
}

impl AckReporter {
    pub fn new(
        store: Arc<dyn CommandStorePort>,
        sink: Arc<dyn MessageSink>,
        events: broadcast::Receiver<SessionEvent>,
        resend_interval: Duration,
    ) -> (Self, ReporterHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (outstanding_tx, outstanding_rx) = watch::channel(0);
        let reporter = Self {
            store,
            sink,
            events,
            commands,
            outstanding: HashMap::new(),
            outstanding_tx,
            resend_interval,
        };
        let handle = ReporterHandle {
            commands: commands_tx,
            outstanding: outstanding_rx,
        };
        (reporter, handle)
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        self.load_unreported().await;
        if self.sink.is_live() {
            self.send_all().await;
        }

        let mut resend = tokio::time::interval_at(
            Instant::now() + self.resend_interval,
            self.resend_interval,
        );
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },

                event = self.events.recv(), if events_open => match event {
                    Ok(SessionEvent::Ready { generation }) => {
                        if !self.outstanding.is_empty() {
                            tracing::info!(
                                generation,
                                outstanding = self.outstanding.len(),
                                "Session ready, re-sending unconfirmed acknowledgments"
                            );
                            self.send_all().await;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Reporter lagged behind session events");
                        if self.sink.is_live() {
                            self.send_all().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => events_open = false,
                },

                _ = resend.tick() => {
                    if !self.outstanding.is_empty() && self.sink.is_live() {
                        tracing::debug!(
                            outstanding = self.outstanding.len(),
                            "Re-sending unconfirmed acknowledgments"
                        );
                        self.send_all().await;
                    }
                }
            }
        }

        if !self.outstanding.is_empty() {
            tracing::info!(
                outstanding = self.outstanding.len(),
                "Reporter stopping; unconfirmed acknowledgments will be resent after restart"
            );
        }
    }

    async fn load_unreported(&mut self) {
        match self.store.list_unreported().await {
            Ok(records) => {
                for report in records.iter().filter_map(AckReport::from_record) {
                    self.outstanding.insert(report.id.clone(), report);
                }
                if !self.outstanding.is_empty() {
                    tracing::info!(
                        count = self.outstanding.len(),
                        "Loaded unreported command outcomes"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to load unreported outcomes"),
        }
        self.publish_count();
    }

    async fn handle(&mut self, command: ReporterCommand) {
        match command {
            ReporterCommand::Report(report) => {
                self.outstanding.insert(report.id.clone(), report.clone());
                self.publish_count();
                self.send(&report).await;
            }
            ReporterCommand::Confirm(id) => self.confirm(id).await,
            ReporterCommand::Resend(report) => self.send(&report).await,
            ReporterCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn confirm(&mut self, id: CommandId) {
        match self.store.mark_reported(&id).await {
            Ok(record) => {
                self.outstanding.remove(&id);
                tracing::info!(command_id = %id, state = %record.state, "Acknowledgment confirmed");
            }
            Err(e) if e.is_not_found() => {
                self.outstanding.remove(&id);
                tracing::warn!(command_id = %id, "Confirmation for unknown command");
            }
            Err(e) if e.is_invalid_transition() => {
                tracing::warn!(command_id = %id, error = %e, "Confirmation for command without an outcome");
            }
            Err(e) => {
                // Stays outstanding; the next resend earns another confirmation
                tracing::error!(command_id = %id, error = %e, "Failed to record confirmation");
            }
        }
        self.publish_count();
    }

    async fn send(&self, report: &AckReport) {
        if !self.sink.is_live() {
            tracing::debug!(command_id = %report.id, "No live session, acknowledgment queued");
            return;
        }
        match self.sink.send(report.to_message()).await {
            Ok(()) => tracing::debug!(
                command_id = %report.id,
                outcome = %report.outcome,
                "Acknowledgment sent"
            ),
            Err(e) => tracing::debug!(
                command_id = %report.id,
                error = %e,
                "Acknowledgment send failed, will retry"
            ),
        }
    }

    async fn send_all(&self) {
        let mut reports: Vec<&AckReport> = self.outstanding.values().collect();
        reports.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        for report in reports {
            self.send(report).await;
        }
    }

    fn publish_count(&self) {
        self.outstanding_tx.send_replace(self.outstanding.len());
    }
}
