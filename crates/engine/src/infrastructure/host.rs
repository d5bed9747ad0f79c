//! Host runtime adapters
//!
//! Game servers only allow world mutations from their main tick thread. The
//! [`MainContextQueue`] is the scoped hand-off onto that thread: async callers
//! submit a request and await its reply, while the host drains queued jobs at
//! its own tick boundaries through a [`MainContextDrain`].
//!
//! [`StandaloneHost`] is the host used by the runner binary and by tests. It
//! keeps a roster of online players and runs the drain on a timer.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use storesync_domain::PlayerId;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::ports::{ExecutionError, ExecutionRequest, HostRuntime};

struct MainContextJob {
    request: ExecutionRequest,
    reply: oneshot::Sender<Result<(), ExecutionError>>,
}

/// Submitting half of the main-context hand-off.
#[derive(Clone)]
pub struct MainContextQueue {
    jobs: mpsc::UnboundedSender<MainContextJob>,
}

/// Draining half, owned by whatever runs on the host's main thread.
pub struct MainContextDrain {
    jobs: mpsc::UnboundedReceiver<MainContextJob>,
}

pub fn main_context_queue() -> (MainContextQueue, MainContextDrain) {
    let (jobs, rx) = mpsc::unbounded_channel();
    (MainContextQueue { jobs }, MainContextDrain { jobs: rx })
}

impl MainContextQueue {
    /// Queue a request for the next tick and wait for its result.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<(), ExecutionError> {
        let (reply, result) = oneshot::channel();
        self.jobs
            .send(MainContextJob { request, reply })
            .map_err(|_| ExecutionError::failure("main context is not accepting work"))?;

        result
            .await
            .map_err(|_| ExecutionError::failure("main context dropped the job"))?
    }
}

impl MainContextDrain {
    /// Run every queued job on the caller's thread. Returns how many ran.
    ///
    /// Jobs whose submitter already gave up (timed out or was cancelled) are
    /// skipped, so an abandoned command never runs behind the engine's back.
    pub fn run_pending<F>(&mut self, mut execute: F) -> usize
    where
        F: FnMut(&ExecutionRequest) -> Result<(), ExecutionError>,
    {
        let mut ran = 0;
        while let Ok(job) = self.jobs.try_recv() {
            if job.reply.is_closed() {
                tracing::debug!(
                    command_id = %job.request.command_id,
                    "Skipping main-context job abandoned by its submitter"
                );
                continue;
            }
            let result = execute(&job.request);
            let _ = job.reply.send(result);
            ran += 1;
        }
        ran
    }
}

/// Host runtime for a process without a real game server attached.
pub struct StandaloneHost {
    roster: RwLock<HashSet<PlayerId>>,
    everyone_online: bool,
    connects: broadcast::Sender<PlayerId>,
    main_context: MainContextQueue,
}

impl StandaloneHost {
    pub fn new(main_context: MainContextQueue) -> Self {
        let (connects, _) = broadcast::channel(256);
        Self {
            roster: RwLock::new(HashSet::new()),
            everyone_online: false,
            connects,
            main_context,
        }
    }

    /// Treat every player as online (console-only deployments).
    pub fn with_everyone_online(mut self) -> Self {
        self.everyone_online = true;
        self
    }

    pub fn player_connected(&self, player: PlayerId) {
        self.roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(player.clone());
        tracing::debug!(player = %player, "Player connected");
        // No subscribers yet is fine
        let _ = self.connects.send(player);
    }

    pub fn player_disconnected(&self, player: &PlayerId) {
        self.roster
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(player);
        tracing::debug!(player = %player, "Player disconnected");
    }
}

#[async_trait]
impl HostRuntime for StandaloneHost {
    fn is_player_online(&self, player: &PlayerId) -> bool {
        self.everyone_online
            || self
                .roster
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(player)
    }

    async fn run_on_main_context(&self, request: ExecutionRequest) -> Result<(), ExecutionError> {
        self.main_context.submit(request).await
    }

    fn subscribe_player_connect(&self) -> broadcast::Receiver<PlayerId> {
        self.connects.subscribe()
    }
}

/// Tick loop standing in for the game server's main thread.
pub async fn run_main_context<F>(
    mut drain: MainContextDrain,
    tick: Duration,
    cancel: CancellationToken,
    mut execute: F,
) where
    F: FnMut(&ExecutionRequest) -> Result<(), ExecutionError> + Send,
{
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                drain.run_pending(&mut execute);
            }
        }
    }
    tracing::debug!("Main context loop stopped");
}
