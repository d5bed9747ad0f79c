//! Session loss, credential rejection and restart recovery.

use std::sync::Arc;
use std::time::Duration;

use storesync_domain::{AckOutcome, CommandId, CommandState, StateUpdate};
use tempfile::TempDir;

use super::*;
use crate::connection::{Credentials, SessionStatus};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::ports::{ClockPort, CommandStorePort};
use crate::infrastructure::sqlite_store::SqliteCommandStore;
use crate::test_fixtures::{eventually, FakeRemote};

#[tokio::test]
async fn unconfirmed_ack_is_resent_after_the_session_drops() {
    let h = Harness::new();
    h.remote.set_auto_confirm(false);
    h.start().await;

    h.remote
        .issue(issued("c1", "ivy", "give ivy lantern 1", false))
        .await;
    h.wait_for_state("c1", CommandState::Executed).await;
    eventually("first ack", || async { !h.remote.acks_for("c1").is_empty() }).await;
    assert_eq!(h.coordinator.outstanding_acks().await, 1);

    h.remote.drop_session();
    eventually("reconnected", || async {
        h.remote.sessions_opened() >= 2 && h.coordinator.connection().status().is_live()
    })
    .await;
    let before = h.remote.acks_for("c1").len();
    eventually("ack re-sent on the new session", || async {
        h.remote.acks_for("c1").len() > before
    })
    .await;

    assert!(h.remote.confirm(&CommandId::new("c1")).await);
    h.wait_for_state("c1", CommandState::Acknowledged).await;
    eventually("nothing outstanding", || async {
        h.coordinator.outstanding_acks().await == 0
    })
    .await;

    assert_eq!(h.host.executor.calls_for("c1"), 1, "reconnect never re-executes");
    assert!(h
        .remote
        .auth_identities()
        .iter()
        .all(|identity| identity == "lobby-1"));
}

#[tokio::test]
async fn rejected_credentials_stop_reconnecting_until_rotated() {
    let h = Harness::new();
    h.remote.reject_auth("token revoked");
    h.coordinator.start().await.expect("start");

    eventually("handshake attempted", || async {
        h.remote.auth_identities().len() == 1
    })
    .await;
    eventually("left disconnected", || async {
        h.coordinator.connection().status() == SessionStatus::Disconnected
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.remote.sessions_opened(), 1, "no retry on auth failure");

    h.remote.accept_auth();
    h.coordinator
        .rotate_credentials(Credentials::new("lobby-1", "fresh-token"))
        .await
        .expect("rotate");
    h.wait_live().await;
    assert_eq!(h.remote.sessions_opened(), 2);

    h.remote
        .issue(issued("c1", "jack", "give jack map 1", false))
        .await;
    h.wait_for_state("c1", CommandState::Acknowledged).await;
}

#[tokio::test]
async fn restart_requeues_interrupted_execution_and_resends_outcomes() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("commands.db");
    let path = path.to_str().expect("utf-8 path");
    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock::new());

    // A previous run crashed with c1 mid-execution and c2 executed but unreported
    {
        let store = SqliteCommandStore::open(path, clock.clone()).await.expect("open");
        for id in ["c1", "c2"] {
            let command = issued(id, "kim", &format!("give kim {id}"), false)
                .into_command(clock.now());
            store.put(command).await.expect("put");
            store
                .update_state(&CommandId::new(id), StateUpdate::to(CommandState::Executing))
                .await
                .expect("claim");
        }
        store
            .update_state(&CommandId::new("c2"), StateUpdate::to(CommandState::Executed))
            .await
            .expect("finish");
        store.close().await;
    }

    let store: Arc<dyn CommandStorePort> =
        Arc::new(SqliteCommandStore::open(path, clock).await.expect("reopen"));
    let h = Harness::build(test_config(), store, FakeRemote::new());
    h.start().await;

    h.wait_for_state("c1", CommandState::Acknowledged).await;
    h.wait_for_state("c2", CommandState::Acknowledged).await;
    h.settle().await;

    assert_eq!(h.host.executor.call_ids(), vec!["c1"], "c2 already ran");
    let c1 = h.record("c1").await.expect("stored");
    assert_eq!(c1.attempts, 2);
    assert_eq!(h.remote.acks_for("c2").len(), 1);
    assert_eq!(h.remote.acks_for("c2")[0].outcome, AckOutcome::Success);

    h.coordinator.shutdown().await.expect("shutdown");
}
