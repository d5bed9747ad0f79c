//! Execution failures: transient retries, the retry cap, rejections.

use storesync_domain::{AckOutcome, CommandState};

use super::*;
use crate::infrastructure::ports::ExecutionError;
use crate::test_fixtures::eventually;

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let h = Harness::new();
    h.host.executor.script(
        "c1",
        vec![
            Err(ExecutionError::failure("server busy")),
            Err(ExecutionError::failure("server busy")),
        ],
    );
    h.start().await;

    h.remote
        .issue(issued("c1", "dave", "give dave shield 1", false))
        .await;

    h.wait_for_state("c1", CommandState::Acknowledged).await;
    let record = h.record("c1").await.expect("stored");
    assert_eq!(record.attempts, 3);
    assert_eq!(h.host.executor.calls_for("c1"), 3);

    let attempts: Vec<u32> = h
        .host
        .executor
        .calls()
        .iter()
        .map(|req| req.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    let acks = h.remote.acks_for("c1");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].outcome, AckOutcome::Success);
}

#[tokio::test]
async fn persistent_failure_stops_at_the_retry_cap_and_reports_failure() {
    let h = Harness::new();
    h.host
        .executor
        .fail_always("c1", ExecutionError::failure("inventory full"));
    h.start().await;

    h.remote
        .issue(issued("c1", "erin", "give erin anvil 64", false))
        .await;

    eventually("failure ack", || async { !h.remote.acks_for("c1").is_empty() }).await;
    h.settle().await;

    // max_execution_retries = 3 in the test config
    assert_eq!(h.host.executor.calls_for("c1"), 4);
    let record = h.record("c1").await.expect("stored");
    assert_eq!(record.state, CommandState::Failed);
    assert_eq!(record.attempts, 4);
    assert!(record.is_reported());

    let acks = h.remote.acks_for("c1");
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].outcome, AckOutcome::Failure);
    let detail = acks[0].detail.as_deref().unwrap_or_default();
    assert!(detail.contains("inventory full"), "detail was {detail:?}");
    assert!(detail.contains("gave up after 4 attempts"), "detail was {detail:?}");
}

#[tokio::test]
async fn rejected_execution_fails_on_the_first_attempt() {
    let h = Harness::new();
    h.host
        .executor
        .fail_always("c1", ExecutionError::rejected("unknown item 'diamnod'"));
    h.start().await;

    h.remote
        .issue(issued("c1", "frank", "give frank diamnod 1", false))
        .await;

    eventually("failure ack", || async { !h.remote.acks_for("c1").is_empty() }).await;
    h.settle().await;

    assert_eq!(h.host.executor.calls_for("c1"), 1);
    let ack = &h.remote.acks_for("c1")[0];
    assert_eq!(ack.outcome, AckOutcome::Failure);
    assert_eq!(ack.detail.as_deref(), Some("unknown item 'diamnod'"));
}

#[tokio::test]
async fn empty_payload_fails_without_reaching_the_host() {
    let h = Harness::new();
    h.start().await;

    h.remote.issue(issued("c1", "gina", "   ", false)).await;

    eventually("failure ack", || async { !h.remote.acks_for("c1").is_empty() }).await;
    assert!(h.host.executor.calls().is_empty());
    let record = h.record("c1").await.expect("stored");
    assert_eq!(record.state, CommandState::Failed);
    assert_eq!(record.last_error.as_deref(), Some("payload is empty"));
}

#[tokio::test]
async fn one_failing_command_does_not_block_others() {
    let h = Harness::new();
    h.host
        .executor
        .fail_always("bad", ExecutionError::rejected("malformed"));
    h.start().await;

    h.remote.issue(issued("bad", "hank", "give hank ???", false)).await;
    h.remote
        .issue(issued("good", "hank", "give hank torch 4", false))
        .await;

    h.wait_for_state("good", CommandState::Acknowledged).await;
    eventually("bad reported", || async {
        h.record("bad").await.is_some_and(|r| r.is_reported())
    })
    .await;
}
