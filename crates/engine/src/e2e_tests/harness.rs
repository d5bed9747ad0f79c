//! Wiring shared by the end-to-end scenarios.

use std::sync::Arc;
use std::time::Duration;

use storesync_domain::{CommandId, CommandRecord, CommandState, PlayerId};
use storesync_shared::CommandIssued;

use crate::config::{BackoffConfig, EngineConfig};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::memory_store::InMemoryCommandStore;
use crate::infrastructure::ports::{ClockPort, CommandStorePort};
use crate::test_fixtures::{eventually, FakeRemote, TestHost};
use crate::SyncCoordinator;

/// Timings shrunk so scenarios settle in milliseconds.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        server_identity: "lobby-1".to_string(),
        auth_token: "secret".to_string(),
        max_execution_retries: 3,
        heartbeat_interval_ms: 1_000,
        handshake_timeout_ms: 1_000,
        backoff: BackoffConfig {
            base_ms: 20,
            factor: 2.0,
            max_ms: 200,
            jitter: 0.0,
        },
        execution_timeout_ms: 1_000,
        execution_retry_delay_ms: 0,
        ack_resend_interval_ms: 100,
        rescan_interval_ms: 50,
        drain_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

pub fn issued(id: &str, player: &str, payload: &str, requires_online_player: bool) -> CommandIssued {
    CommandIssued {
        id: CommandId::new(id),
        player: PlayerId::new(player),
        payload: payload.to_string(),
        requires_online_player,
        priority: 0,
    }
}

/// A coordinator plus the fakes around it.
pub struct Harness {
    pub remote: FakeRemote,
    pub host: TestHost,
    pub store: Arc<dyn CommandStorePort>,
    pub coordinator: SyncCoordinator,
}

impl Harness {
    /// In-memory store, default test timings.
    pub fn new() -> Self {
        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());
        let store: Arc<dyn CommandStorePort> = Arc::new(InMemoryCommandStore::new(clock));
        Self::build(test_config(), store, FakeRemote::new())
    }

    pub fn build(config: EngineConfig, store: Arc<dyn CommandStorePort>, remote: FakeRemote) -> Self {
        let host = TestHost::start();
        let coordinator = SyncCoordinator::new(
            config,
            Arc::clone(&store),
            remote.transport(),
            host.host.clone(),
            Arc::new(SystemClock::new()),
        );
        Self {
            remote,
            host,
            store,
            coordinator,
        }
    }

    /// Start and wait for the first authenticated session.
    pub async fn start(&self) {
        self.coordinator.start().await.expect("engine starts");
        self.wait_live().await;
    }

    pub async fn wait_live(&self) {
        eventually("authenticated session", || async {
            self.coordinator.connection().status().is_live()
        })
        .await;
    }

    pub async fn record(&self, id: &str) -> Option<CommandRecord> {
        self.store
            .get(&CommandId::new(id))
            .await
            .expect("store readable")
    }

    pub async fn wait_for_state(&self, id: &str, state: CommandState) {
        eventually(&format!("{id} to reach {state}"), || async {
            self.record(id).await.is_some_and(|record| record.state == state)
        })
        .await;
    }

    /// Give stray retries and rescans a chance to misbehave before counting.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
}
