//! Admission, dedup and delivery of issued commands.

use storesync_domain::{AckOutcome, CommandId, CommandState, PlayerId};

use super::*;
use crate::test_fixtures::eventually;

#[tokio::test]
async fn offline_purchase_waits_for_the_player_then_is_acknowledged() {
    let h = Harness::new();
    h.start().await;
    let alice = PlayerId::new("alice");

    h.remote
        .issue(issued("c1", "alice", "give alice diamond 1", true))
        .await;
    h.remote
        .issue(issued("c2", "alice", "give alice emerald 2", true))
        .await;

    eventually("both parked", || async {
        h.coordinator.parked_for(&alice).await.len() == 2
    })
    .await;
    assert_eq!(
        h.coordinator.parked_for(&alice).await,
        vec![CommandId::new("c1"), CommandId::new("c2")]
    );
    assert_eq!(
        h.remote.receipts(),
        vec![CommandId::new("c1"), CommandId::new("c2")]
    );
    h.settle().await;
    assert!(h.host.executor.calls().is_empty(), "nothing runs while alice is away");
    assert_eq!(h.record("c1").await.map(|r| r.state), Some(CommandState::Pending));

    h.host.host.player_connected(alice.clone());

    h.wait_for_state("c1", CommandState::Acknowledged).await;
    h.wait_for_state("c2", CommandState::Acknowledged).await;
    assert_eq!(h.host.executor.call_ids(), vec!["c1", "c2"]);

    let acks = h.remote.acks_for("c1");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].outcome, AckOutcome::Success);
    assert_eq!(acks[0].detail, None);
}

#[tokio::test]
async fn redelivered_command_executes_exactly_once() {
    let h = Harness::new();
    h.start().await;

    for _ in 0..5 {
        h.remote
            .issue(issued("c1", "bob", "give bob sword 1", false))
            .await;
    }

    h.wait_for_state("c1", CommandState::Acknowledged).await;
    // Deliveries that land after the outcome re-send the ack instead
    for _ in 0..2 {
        h.remote
            .issue(issued("c1", "bob", "give bob sword 1", false))
            .await;
    }
    h.settle().await;

    assert_eq!(h.host.executor.calls_for("c1"), 1);
    let acks = h.remote.acks_for("c1");
    assert!(!acks.is_empty());
    assert!(acks.iter().all(|ack| ack.outcome == AckOutcome::Success));
}

#[tokio::test]
async fn duplicate_of_acknowledged_command_only_resends_its_ack() {
    let h = Harness::new();
    h.start().await;

    h.remote
        .issue(issued("c1", "bob", "give bob apple 3", false))
        .await;
    h.wait_for_state("c1", CommandState::Acknowledged).await;
    eventually("first ack", || async { h.remote.acks_for("c1").len() == 1 }).await;
    let receipts_before = h.remote.receipts().len();

    h.remote
        .issue(issued("c1", "bob", "give bob apple 3", false))
        .await;

    eventually("ack re-sent", || async { h.remote.acks_for("c1").len() == 2 }).await;
    h.settle().await;
    assert_eq!(h.host.executor.calls_for("c1"), 1);
    assert_eq!(h.remote.receipts().len(), receipts_before, "no receipt for finished commands");
    assert_eq!(h.record("c1").await.map(|r| r.state), Some(CommandState::Acknowledged));
}

#[tokio::test]
async fn command_without_player_is_refused_with_a_failure_ack() {
    let h = Harness::new();
    h.start().await;

    h.remote.issue(issued("c1", "  ", "give diamond 1", true)).await;

    eventually("failure ack", || async { !h.remote.acks_for("c1").is_empty() }).await;
    let ack = &h.remote.acks_for("c1")[0];
    assert_eq!(ack.outcome, AckOutcome::Failure);
    assert!(ack.detail.as_deref().is_some_and(|d| d.contains("no target player")));
    assert!(h.record("c1").await.is_none(), "refused commands are not stored");
    assert!(h.host.executor.calls().is_empty());
}

#[tokio::test]
async fn backlog_batch_is_admitted_in_order() {
    let h = Harness::new();
    h.start().await;
    h.host.host.player_connected(PlayerId::new("carol"));

    h.remote
        .push(storesync_shared::ServerMessage::CommandBatch {
            commands: vec![
                issued("b1", "carol", "give carol bread 1", true),
                issued("b2", "carol", "give carol bread 2", true),
                issued("b3", "carol", "give carol bread 3", true),
            ],
        })
        .await;

    for id in ["b1", "b2", "b3"] {
        h.wait_for_state(id, CommandState::Acknowledged).await;
    }
    assert_eq!(
        h.remote.receipts(),
        vec![CommandId::new("b1"), CommandId::new("b2"), CommandId::new("b3")]
    );
    assert_eq!(h.host.executor.call_ids(), vec!["b1", "b2", "b3"]);
}
