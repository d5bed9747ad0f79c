//! Execution scheduling against the host runtime.
//!
//! Commands that need their player online go through that player's
//! [`PendingQueue`] and are drained one at a time, in queue order, while the
//! player is connected. Commands without that requirement run as soon as a
//! worker permit is free. Either way the store's `Pending -> Executing`
//! compare-and-swap is the execution lock: a command that cannot be claimed is
//! simply skipped.
//!
//! A periodic rescan of the store picks up anything the event paths missed:
//! rows recovered at startup, retries whose delay has elapsed, and parked
//! players whose connect event was lost.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashSet;
use storesync_domain::{
    CommandId, CommandRecord, CommandState, PendingQueue, PlayerId, QueuedCommand, StateUpdate,
};
use tokio::sync::{broadcast, Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{BackoffConfig, EngineConfig};
use crate::connection::BackoffState;
use crate::infrastructure::ports::{
    ClockPort, CommandStorePort, ExecutionError, ExecutionRequest, HostRuntime, PendingScan,
    StoreError,
};
use crate::use_cases::reporter::{AckReport, ReporterHandle};

/// Writes after the host already ran a command are retried this many times.
const OUTCOME_WRITE_ATTEMPTS: u32 = 5;

fn outcome_write_backoff() -> BackoffConfig {
    BackoffConfig {
        base_ms: 50,
        factor: 2.0,
        max_ms: 1_000,
        jitter: 0.0,
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    pub max_execution_retries: u32,
    pub execution_timeout: Duration,
    /// Linear step: the n-th retry waits `retry_delay * n`
    pub retry_delay: Duration,
    pub rescan_interval: Duration,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            max_execution_retries: config.max_execution_retries,
            execution_timeout: config.execution_timeout(),
            retry_delay: config.execution_retry_delay(),
            rescan_interval: config.rescan_interval(),
        }
    }
}

#[derive(Default)]
struct PlayerQueues {
    parked: HashMap<PlayerId, PendingQueue>,
    /// Players with a drain task running
    draining: HashSet<PlayerId>,
}

struct Inner {
    store: Arc<dyn CommandStorePort>,
    host: Arc<dyn HostRuntime>,
    reporter: ReporterHandle,
    clock: Arc<dyn ClockPort>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    in_flight: DashSet<CommandId>,
    queues: Mutex<PlayerQueues>,
    tasks: StdMutex<JoinSet<()>>,
    wake: Notify,
    cancel: CancellationToken,
    accepting: AtomicBool,
}

#[derive(Clone)]
pub struct ExecutionScheduler {
    inner: Arc<Inner>,
}

impl ExecutionScheduler {
    pub fn new(
        store: Arc<dyn CommandStorePort>,
        host: Arc<dyn HostRuntime>,
        reporter: ReporterHandle,
        clock: Arc<dyn ClockPort>,
        settings: SchedulerSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.worker_count.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                host,
                reporter,
                clock,
                settings,
                permits,
                in_flight: DashSet::new(),
                queues: Mutex::new(PlayerQueues::default()),
                tasks: StdMutex::new(JoinSet::new()),
                wake: Notify::new(),
                cancel: CancellationToken::new(),
                accepting: AtomicBool::new(true),
            }),
        }
    }

    /// Spawn the rescan and player-connect loops. The first rescan runs immediately.
    pub fn start(&self) {
        let connects = self.inner.host.subscribe_player_connect();

        let inner = Arc::clone(&self.inner);
        self.inner.spawn(inner.player_connect_loop(connects));
        let inner = Arc::clone(&self.inner);
        self.inner.spawn(inner.rescan_loop());
        tracing::info!(
            workers = self.inner.settings.worker_count,
            max_retries = self.inner.settings.max_execution_retries,
            "Execution scheduler started"
        );
    }

    /// Hand over a freshly admitted (or re-delivered) pending command.
    pub async fn submit(&self, record: CommandRecord) {
        self.inner.consider(record).await;
    }

    /// Trigger a store rescan without waiting for the interval.
    pub fn nudge(&self) {
        self.inner.wake.notify_one();
    }

    /// Commands parked for `player`, in execution order.
    pub async fn parked_for(&self, player: &PlayerId) -> Vec<CommandId> {
        let queues = self.inner.queues.lock().await;
        queues
            .parked
            .get(player)
            .map(|queue| queue.iter().map(|entry| entry.id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Stop taking work and wait (bounded) for running executions.
    ///
    /// Executions still running at the deadline are aborted; their commands
    /// stay `Executing` in the store and are re-queued by the next startup
    /// recovery.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        self.inner.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.inner.tasks());
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Scheduler task panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Drain timeout reached; aborting executions, they resume after restart"
            );
            tasks.abort_all();
        }
        tracing::info!("Execution scheduler stopped");
    }
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks();
        // Reap finished tasks so the set does not grow without bound
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    async fn consider(self: &Arc<Self>, record: CommandRecord) {
        if !self.is_accepting() || record.state != CommandState::Pending {
            return;
        }
        if self.in_flight.contains(record.id()) {
            return;
        }
        // Not parked while waiting: newer commands for the same player may
        // run first, the rescan picks this one up once due
        if !record.is_due(self.clock.now()) {
            tracing::trace!(command_id = %record.id(), "Waiting for retry delay");
            return;
        }

        if !record.command.requires_online_player {
            let inner = Arc::clone(self);
            let id = record.id().clone();
            self.spawn(async move { inner.execute(id).await });
            return;
        }

        let player = record.player().clone();
        let online = {
            let mut queues = self.queues.lock().await;
            let queue = queues
                .parked
                .entry(player.clone())
                .or_insert_with(|| PendingQueue::new(player.clone()));
            let added = queue.push(QueuedCommand::from(&record));
            // Checked under the lock so a concurrent connect event cannot slip between
            let online = self.host.is_player_online(&player);
            if added && !online {
                tracing::debug!(
                    command_id = %record.id(),
                    player = %player,
                    queued = queue.len(),
                    "Player offline, command parked"
                );
            }
            online
        };

        if online {
            self.start_drain(player).await;
        }
    }

    async fn start_drain(self: &Arc<Self>, player: PlayerId) {
        {
            let mut queues = self.queues.lock().await;
            if !queues.draining.insert(player.clone()) {
                return;
            }
        }
        let inner = Arc::clone(self);
        self.spawn(async move { inner.drain_player(player).await });
    }

    /// Run a player's parked commands in order until the queue is empty or the
    /// player leaves.
    async fn drain_player(self: Arc<Self>, player: PlayerId) {
        tracing::debug!(player = %player, "Draining parked commands");
        loop {
            let next = {
                let mut queues = self.queues.lock().await;
                let online = self.host.is_player_online(&player);
                let popped = if self.is_accepting() && online {
                    queues
                        .parked
                        .get_mut(&player)
                        .and_then(PendingQueue::pop_front)
                } else {
                    None
                };

                match popped {
                    Some(entry) => entry,
                    None => {
                        queues.draining.remove(&player);
                        if queues.parked.get(&player).is_some_and(PendingQueue::is_empty) {
                            queues.parked.remove(&player);
                        }
                        if !online {
                            tracing::debug!(
                                player = %player,
                                "Player went offline, remaining commands stay parked"
                            );
                        }
                        return;
                    }
                }
            };

            self.execute(next.id).await;
        }
    }

    async fn execute(self: &Arc<Self>, id: CommandId) {
        if !self.in_flight.insert(id.clone()) {
            return;
        }
        match Arc::clone(&self.permits).acquire_owned().await {
            // Draining began while this one waited for a worker
            Ok(_permit) if !self.is_accepting() => {
                tracing::debug!(command_id = %id, "Draining, command left pending");
            }
            Ok(_permit) => self.run_once(&id).await,
            Err(_) => tracing::debug!(command_id = %id, "Worker pool closed"),
        }
        self.in_flight.remove(&id);
    }

    async fn run_once(self: &Arc<Self>, id: &CommandId) {
        let record = match self.store.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(command_id = %id, "Scheduled command no longer in store");
                return;
            }
            Err(e) => {
                tracing::error!(command_id = %id, error = %e, "Failed to load command");
                return;
            }
        };
        // Re-check against the authoritative copy
        if record.state != CommandState::Pending || !record.is_due(self.clock.now()) {
            return;
        }

        if let Some(reason) = record.command.payload_rejection() {
            tracing::error!(command_id = %id, reason = %reason, "Command rejected before execution");
            self.finish(id, StateUpdate::to(CommandState::Failed).with_detail(reason))
                .await;
            return;
        }

        let max_retries = self.settings.max_execution_retries;
        if record.attempts > max_retries {
            let reason = format!("retry budget exhausted after {} attempts", record.attempts);
            tracing::error!(command_id = %id, attempts = record.attempts, "Retry budget exhausted");
            self.finish(id, StateUpdate::to(CommandState::Failed).with_detail(reason))
                .await;
            return;
        }

        if !self.is_accepting() {
            return;
        }
        let claimed = match self
            .store
            .update_state(id, StateUpdate::to(CommandState::Executing))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) if e.is_invalid_transition() => {
                tracing::debug!(command_id = %id, "Command already claimed elsewhere");
                return;
            }
            Err(e) => {
                tracing::error!(command_id = %id, error = %e, "Failed to claim command");
                return;
            }
        };

        let attempt = claimed.attempts;
        let request = ExecutionRequest {
            command_id: id.clone(),
            player: claimed.player().clone(),
            payload: claimed.command.payload.clone(),
            attempt,
        };
        tracing::info!(
            command_id = %id,
            player = %claimed.player(),
            attempt,
            "Executing command"
        );

        let timeout = self.settings.execution_timeout;
        let result = match tokio::time::timeout(timeout, self.host.run_on_main_context(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::failure(format!(
                "timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                tracing::info!(command_id = %id, attempt, "Command executed");
                self.finish(id, StateUpdate::to(CommandState::Executed)).await;
            }
            Err(e) if e.is_retryable() && attempt <= max_retries => {
                let delay = self.settings.retry_delay * attempt;
                let not_before = self.clock.after(delay);
                tracing::warn!(
                    command_id = %id,
                    attempt,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Execution failed, will retry"
                );
                let update = StateUpdate::to(CommandState::Pending)
                    .with_detail(e.message())
                    .not_before(not_before);
                match self.write_after_run(id, update).await {
                    Ok(_) => self.schedule_retry(id.clone(), delay),
                    Err(e) => {
                        tracing::error!(command_id = %id, error = %e, "Failed to re-queue command")
                    }
                }
            }
            Err(e) => {
                let detail = if e.is_retryable() {
                    format!("{} (gave up after {attempt} attempts)", e.message())
                } else {
                    e.message().to_string()
                };
                tracing::error!(command_id = %id, attempt, error = %e, "Command failed");
                self.finish(id, StateUpdate::to(CommandState::Failed).with_detail(detail))
                    .await;
            }
        }
    }

    /// Record a terminal outcome and hand it to the reporter.
    async fn finish(&self, id: &CommandId, update: StateUpdate) {
        match self.write_after_run(id, update).await {
            Ok(record) => {
                if let Some(report) = AckReport::from_record(&record) {
                    self.reporter.report(report);
                }
            }
            Err(e) => tracing::error!(command_id = %id, error = %e, "Failed to record outcome"),
        }
    }

    /// Persist the state that follows a host invocation.
    ///
    /// The command already ran, so a lost write would leave it `Executing`
    /// until restart recovery runs it again. Store errors are retried with
    /// backoff; a transition rejected after a failed attempt is checked
    /// against the stored row in case that attempt landed.
    async fn write_after_run(
        &self,
        id: &CommandId,
        update: StateUpdate,
    ) -> Result<CommandRecord, StoreError> {
        let mut backoff = BackoffState::new(outcome_write_backoff());
        loop {
            let err = match self.store.update_state(id, update.clone()).await {
                Ok(record) => return Ok(record),
                Err(e) => e,
            };

            if err.is_invalid_transition() {
                if backoff.attempts() > 0 {
                    if let Ok(Some(record)) = self.store.get(id).await {
                        if record.state == update.to {
                            return Ok(record);
                        }
                    }
                }
                return Err(err);
            }
            if backoff.attempts() + 1 >= OUTCOME_WRITE_ATTEMPTS {
                return Err(err);
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                command_id = %id,
                error = %err,
                attempt = backoff.attempts(),
                retry_in_ms = delay.as_millis() as u64,
                "Failed to persist execution result, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn schedule_retry(self: &Arc<Self>, id: CommandId, delay: Duration) {
        // Draining: the next startup's rescan picks the row up
        if self.cancel.is_cancelled() {
            return;
        }
        let inner = Arc::clone(self);
        self.spawn(async move {
            tokio::select! {
                _ = inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => match inner.store.get(&id).await {
                    Ok(Some(record)) => inner.consider(record).await,
                    Ok(None) => {}
                    Err(e) => tracing::warn!(command_id = %id, error = %e, "Retry lookup failed"),
                },
            }
        });
    }

    async fn rescan(self: &Arc<Self>) {
        let mut scan = PendingScan::new(Arc::clone(&self.store), None);
        loop {
            match scan.next().await {
                Ok(Some(record)) => self.consider(record).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Pending scan failed");
                    break;
                }
            }
        }
    }

    async fn rescan_loop(self: Arc<Self>) {
        loop {
            self.rescan().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::timeout(self.settings.rescan_interval, self.wake.notified()) => {}
            }
        }
    }

    async fn player_connect_loop(self: Arc<Self>, mut connects: broadcast::Receiver<PlayerId>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = connects.recv() => match event {
                    Ok(player) => {
                        let has_parked = self
                            .queues
                            .lock()
                            .await
                            .parked
                            .get(&player)
                            .is_some_and(|queue| !queue.is_empty());
                        if has_parked {
                            tracing::info!(player = %player, "Player connected, draining parked commands");
                            self.start_drain(player).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed player connect events, rescanning");
                        self.wake.notify_one();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }
}
