//! Shared test doubles for component and scenario tests.
//!
//! - [`FakeRemote`] / [`MemoryTransport`] - scripted remote service
//! - [`TestHost`] - a [`StandaloneHost`] whose main context records every
//!   invocation through a [`RecordingExecutor`]
//! - [`eventually`] - polling assertion for asynchronous outcomes

pub mod remote;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use storesync_domain::CommandId;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::host::{main_context_queue, run_main_context, StandaloneHost};
use crate::infrastructure::ports::{ExecutionError, ExecutionRequest};

pub use remote::{FakeRemote, MemoryTransport, ReceivedAck};

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Default)]
struct ExecutorState {
    calls: Vec<ExecutionRequest>,
    scripted: HashMap<CommandId, VecDeque<Result<(), ExecutionError>>>,
    always: HashMap<CommandId, ExecutionError>,
}

/// Main-context executor that records requests and replays scripted results.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    state: Arc<Mutex<ExecutorState>>,
}

impl RecordingExecutor {
    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().expect("executor state lock")
    }

    /// Results for successive invocations of `id`; afterwards it succeeds.
    pub fn script(&self, id: &str, results: Vec<Result<(), ExecutionError>>) {
        self.lock()
            .scripted
            .insert(CommandId::new(id), results.into());
    }

    pub fn fail_always(&self, id: &str, error: ExecutionError) {
        self.lock().always.insert(CommandId::new(id), error);
    }

    pub fn execute(&self, request: &ExecutionRequest) -> Result<(), ExecutionError> {
        let mut state = self.lock();
        state.calls.push(request.clone());
        if let Some(error) = state.always.get(&request.command_id) {
            return Err(error.clone());
        }
        state
            .scripted
            .get_mut(&request.command_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.lock().calls.clone()
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .map(|req| req.command_id.to_string())
            .collect()
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|req| req.command_id.as_str() == id)
            .count()
    }
}

/// A standalone host with its main-context loop running.
pub struct TestHost {
    pub host: Arc<StandaloneHost>,
    pub executor: RecordingExecutor,
    cancel: CancellationToken,
}

impl TestHost {
    pub fn start() -> Self {
        let (queue, drain) = main_context_queue();
        let host = Arc::new(StandaloneHost::new(queue));
        let executor = RecordingExecutor::default();
        let cancel = CancellationToken::new();

        let recorder = executor.clone();
        tokio::spawn(run_main_context(
            drain,
            Duration::from_millis(2),
            cancel.clone(),
            move |request: &ExecutionRequest| recorder.execute(request),
        ));

        Self {
            host,
            executor,
            cancel,
        }
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
