use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use storesync_domain::{Command, CommandId, CommandState, PlayerId, StateUpdate};

use crate::infrastructure::{
    clock::FixedClock,
    ports::{ClockPort, CommandStorePort, MockClockPort, PendingScan},
    sqlite_store::SqliteCommandStore,
};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0)
        .single()
        .expect("valid timestamp")
}

fn command(id: &str, player: &str, secs: i64) -> Command {
    Command::new(id, player, format!("give {player} diamond 1"), true, at(secs))
}

#[tokio::test]
async fn sqlite_store_survives_restart_and_requeues_executing() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let db_path = temp_dir.path().join("commands.db");
    let db_path_str = db_path.to_string_lossy().to_string();
    let clock: Arc<dyn ClockPort> = Arc::new(FixedClock(at(100)));

    {
        let store = SqliteCommandStore::open(&db_path_str, clock.clone())
            .await
            .expect("open store");
        store.put(command("c1", "alice", 1)).await.expect("put c1");
        store.put(command("c2", "alice", 2)).await.expect("put c2");
        store
            .update_state(&CommandId::new("c1"), StateUpdate::to(CommandState::Executing))
            .await
            .expect("claim c1");

        // Process "crashes" here with c1 mid-execution
        store.close().await;
    }

    let store = SqliteCommandStore::open(&db_path_str, clock)
        .await
        .expect("reopen store");
    assert_eq!(store.recover_executing().await.expect("recover"), 1);

    let c1 = store
        .get(&CommandId::new("c1"))
        .await
        .expect("get")
        .expect("c1 persisted");
    assert_eq!(c1.state, CommandState::Pending);
    assert_eq!(c1.attempts, 1);
    assert_eq!(c1.last_error.as_deref(), Some("interrupted by restart"));

    let store: Arc<dyn CommandStorePort> = Arc::new(store);
    let pending = PendingScan::new(store.clone(), Some(PlayerId::new("alice")))
        .with_page_size(1)
        .collect_all()
        .await
        .expect("scan");
    let ids: Vec<&str> = pending.iter().map(|r| r.id().as_str()).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn sqlite_store_dedups_and_rejects_illegal_transitions() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let db_path = temp_dir.path().join("commands.db");
    let store = SqliteCommandStore::open(
        &db_path.to_string_lossy(),
        Arc::new(FixedClock(at(100))),
    )
    .await
    .expect("open store");

    assert!(store.put(command("c1", "alice", 1)).await.expect("put").was_inserted());
    let again = store.put(command("c1", "bob", 5)).await.expect("put again");
    assert!(!again.was_inserted());
    assert_eq!(again.record().player().as_str(), "alice");

    let id = CommandId::new("c1");
    let err = store
        .update_state(&id, StateUpdate::to(CommandState::Acknowledged))
        .await
        .expect_err("pending cannot jump to acknowledged");
    assert!(err.is_invalid_transition());

    // The record keeps its last valid state
    let record = store.get(&id).await.expect("get").expect("exists");
    assert_eq!(record.state, CommandState::Pending);

    store
        .update_state(&id, StateUpdate::to(CommandState::Executing))
        .await
        .expect("claim");
    let second_claim = store
        .update_state(&id, StateUpdate::to(CommandState::Executing))
        .await
        .expect_err("already executing");
    assert!(second_claim.is_invalid_transition());

    let missing = store
        .update_state(&CommandId::new("nope"), StateUpdate::to(CommandState::Executing))
        .await
        .expect_err("unknown id");
    assert!(missing.is_not_found());
}

#[tokio::test]
async fn sqlite_store_reports_and_purges_after_retention() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let db_path = temp_dir.path().join("commands.db");

    let mut clock = MockClockPort::new();
    clock.expect_now().returning(|| at(1_000));
    let store = SqliteCommandStore::open(&db_path.to_string_lossy(), Arc::new(clock))
        .await
        .expect("open store");

    for id in ["ok", "bad", "waiting"] {
        store.put(command(id, "alice", 1)).await.expect("put");
    }
    let ok = CommandId::new("ok");
    let bad = CommandId::new("bad");
    store
        .update_state(&ok, StateUpdate::to(CommandState::Executing))
        .await
        .expect("claim");
    store
        .update_state(&ok, StateUpdate::to(CommandState::Executed))
        .await
        .expect("executed");
    store
        .update_state(
            &bad,
            StateUpdate::to(CommandState::Failed).with_detail("payload is empty"),
        )
        .await
        .expect("failed");

    let unreported: Vec<String> = store
        .list_unreported()
        .await
        .expect("unreported")
        .iter()
        .map(|r| r.id().to_string())
        .collect();
    assert_eq!(unreported, vec!["ok", "bad"]);

    let acked = store.mark_reported(&ok).await.expect("report ok");
    assert_eq!(acked.state, CommandState::Acknowledged);
    let failed = store.mark_reported(&bad).await.expect("report bad");
    assert_eq!(failed.state, CommandState::Failed);
    assert!(failed.is_reported());
    // Second confirmation is a no-op
    assert_eq!(store.mark_reported(&bad).await.expect("again"), failed);
    assert!(store.list_unreported().await.expect("unreported").is_empty());

    assert_eq!(
        store
            .purge_acknowledged(at(1_000))
            .await
            .expect("purge inside window"),
        0
    );
    assert_eq!(
        store
            .purge_acknowledged(at(1_000) + Duration::seconds(1))
            .await
            .expect("purge past window"),
        2
    );
    assert!(store.get(&ok).await.expect("get").is_none());
    assert!(store
        .get(&CommandId::new("waiting"))
        .await
        .expect("get")
        .is_some());
}
