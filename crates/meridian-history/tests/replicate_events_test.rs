// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the ordered-apply and buffering paths.

mod common;

use std::collections::HashMap;

use common::*;
use meridian_history::persistence::{ExecutionStore, WorkflowState};
use meridian_history::{ReplicationError, RetryReason};

// Remote (dc-west) failover versions are congruent to 1 modulo 10.
const V1: i64 = 11;
const V2: i64 = 21;

#[tokio::test]
async fn test_ordered_apply_creates_execution() {
    let ctx = TestContext::new();

    // 1. Start batch creates the execution row.
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;

    // 2. Continuation batch extends it.
    ctx.apply(
        RUN_ID,
        vec![decision_scheduled(2, V1), decision_started(3, V1, 2)],
    )
    .await;

    let snapshot = ctx.snapshot(RUN_ID).await;
    assert_eq!(snapshot.execution_info.next_event_id, 4);
    assert_eq!(snapshot.execution_info.state, WorkflowState::Running);
    assert_eq!(snapshot.replication_state.last_write_version, V1);
    assert_eq!(snapshot.replication_state.last_write_event_id, 3);
    assert_eq!(ctx.history_ids(RUN_ID).await, vec![1, 2, 3]);

    // Current-run pointer resolves to the created run.
    let current = ctx
        .execution_store
        .get_current_execution(DOMAIN_ID, WORKFLOW_ID)
        .await
        .unwrap();
    assert_eq!(current.run_id, RUN_ID);
}

#[tokio::test]
async fn test_out_of_order_batch_buffers_then_flushes() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    ctx.apply(
        RUN_ID,
        vec![decision_scheduled(2, V1), decision_started(3, V1, 2)],
    )
    .await;

    // Event 5 arrives before event 4; it must be parked, not applied.
    ctx.apply(RUN_ID, vec![activity_scheduled(5, V1, 4)]).await;
    let snapshot = ctx.snapshot(RUN_ID).await;
    assert_eq!(snapshot.execution_info.next_event_id, 4);
    assert!(snapshot.buffered_replication_tasks.contains_key(&5));

    // The gap closes; the flush loop applies the parked batch.
    ctx.apply(RUN_ID, vec![decision_completed(4, V1, 2, 3)]).await;
    let snapshot = ctx.snapshot(RUN_ID).await;
    assert_eq!(snapshot.execution_info.next_event_id, 6);
    assert!(snapshot.buffered_replication_tasks.is_empty());
    assert!(snapshot.activity_infos.contains_key(&5));

    // History stays gap-free.
    assert_eq!(ctx.history_ids(RUN_ID).await, vec![1, 2, 3, 4, 5]);

    let metrics = ctx.replicator.metrics().snapshot();
    assert_eq!(metrics.buffered_tasks, 1);
    assert_eq!(metrics.flushed_tasks, 1);
}

#[tokio::test]
async fn test_out_of_order_without_force_buffer_asks_for_retry() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;

    let request = ctx.replicate_request(
        RUN_ID,
        vec![activity_scheduled(5, V1, 4)],
        HashMap::new(),
        false,
    );
    let err = ctx
        .replicator
        .apply_events(&ctx.token, &request, false)
        .await
        .expect_err("must ask for retry");
    match err {
        ReplicationError::RetryTask {
            reason,
            next_event_id,
            ..
        } => {
            assert_eq!(reason, RetryReason::BufferEvents);
            assert_eq!(next_event_id, Some(2));
        }
        other => panic!("expected RetryTask, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duplicate_batch_is_idempotent() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    let batch = vec![decision_scheduled(2, V1), decision_started(3, V1, 2)];
    ctx.apply(RUN_ID, batch.clone()).await;
    let before = ctx.snapshot(RUN_ID).await;

    // Second delivery of the same batch is dropped as a duplicate.
    ctx.apply(RUN_ID, batch).await;
    let after = ctx.snapshot(RUN_ID).await;
    assert_eq!(
        before.execution_info.next_event_id,
        after.execution_info.next_event_id
    );
    assert_eq!(ctx.history_ids(RUN_ID).await, vec![1, 2, 3]);
    assert_eq!(ctx.replicator.metrics().snapshot().duplicate_events, 1);
}

#[tokio::test]
async fn test_duplicate_start_batch_dropped() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;

    assert_eq!(ctx.history_ids(RUN_ID).await, vec![1]);
    assert_eq!(ctx.replicator.metrics().snapshot().duplicate_events, 1);
}

#[tokio::test]
async fn test_empty_batch_dropped_without_state_change() {
    let ctx = TestContext::new();
    let request = ctx.replicate_request(RUN_ID, vec![started(1, V1)], HashMap::new(), true);
    let mut empty = request.clone();
    empty.history.clear();

    ctx.replicator
        .apply_events(&ctx.token, &empty, false)
        .await
        .expect("empty batch is dropped as success");

    assert_eq!(ctx.replicator.metrics().snapshot().empty_events, 1);
    assert!(ctx
        .execution_store
        .get_workflow_execution(DOMAIN_ID, WORKFLOW_ID, RUN_ID)
        .await
        .is_err());
}

#[tokio::test]
async fn test_stale_batch_dropped_but_signals_survive() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    ctx.apply(
        RUN_ID,
        vec![decision_scheduled(2, V1), decision_started(3, V1, 2)],
    )
    .await;

    // Simulate a failover apply: local state is already at version 20.
    let mut snapshot = ctx.snapshot(RUN_ID).await;
    snapshot.replication_state.last_write_version = 20;
    snapshot.replication_state.current_version = 20;
    ctx.overwrite_snapshot(snapshot).await;

    // A version-11 batch is now stale; only its signal is preserved.
    ctx.apply(
        RUN_ID,
        vec![signaled(4, V1, "release"), decision_scheduled(5, V1)],
    )
    .await;

    let snapshot = ctx.snapshot(RUN_ID).await;
    // The garbage-collected signal was appended locally at version 20.
    assert_eq!(snapshot.execution_info.next_event_id, 5);
    assert_eq!(snapshot.replication_state.last_write_event_id, 4);
    assert_eq!(snapshot.replication_state.last_write_version, 20);
    // The stale decision event must not have produced a pending decision.
    assert!(snapshot.pending_decision.is_none());

    let history = ctx.history(RUN_ID).await;
    let gc_signal = history.iter().find(|e| e.event_id == 4).expect("signal");
    assert_eq!(gc_signal.version, 20);
    match &gc_signal.attributes {
        meridian_protocol::events::EventAttributes::WorkflowExecutionSignaled {
            signal_name,
            ..
        } => assert_eq!(signal_name, "release"),
        other => panic!("expected preserved signal, got {:?}", other),
    }

    assert_eq!(ctx.replicator.metrics().snapshot().stale_events, 1);
}

#[tokio::test]
async fn test_same_cluster_version_bump_accepted_without_reset() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    ctx.apply(
        RUN_ID,
        vec![decision_scheduled(2, V1), decision_started(3, V1, 2)],
    )
    .await;

    // The workflow sat out a round of failovers: version jumps 11 -> 21 but
    // the authoring cluster is unchanged.
    ctx.apply(RUN_ID, vec![decision_completed(4, V2, 2, 3)]).await;

    let snapshot = ctx.snapshot(RUN_ID).await;
    assert_eq!(snapshot.execution_info.next_event_id, 5);
    assert_eq!(snapshot.replication_state.last_write_version, V2);
    assert_eq!(ctx.replicator.metrics().snapshot().history_conflicts, 0);
}

#[tokio::test]
async fn test_third_cluster_version_rejected() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;

    // Version 22 is congruent to neither configured cluster relative to 11.
    let request = ctx.replicate_request(
        RUN_ID,
        vec![decision_scheduled(2, 22)],
        HashMap::new(),
        true,
    );
    let err = ctx
        .replicator
        .apply_events(&ctx.token, &request, false)
        .await
        .expect_err("third cluster must be rejected");
    assert!(matches!(err, ReplicationError::MoreThan2DataCenters));
}

#[tokio::test]
async fn test_continue_as_new_creates_successor_run() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    ctx.apply(
        RUN_ID,
        vec![
            decision_scheduled(2, V1),
            decision_started(3, V1, 2),
            decision_completed(4, V1, 2, 3),
        ],
    )
    .await;

    let mut request = ctx.replicate_request(
        RUN_ID,
        vec![continued_as_new(5, V1, "run-2")],
        HashMap::new(),
        true,
    );
    request.new_run_history = vec![started(1, V1)];
    ctx.replicator
        .apply_events(&ctx.token, &request, false)
        .await
        .expect("continue-as-new applies");

    let old = ctx.snapshot(RUN_ID).await;
    assert_eq!(old.execution_info.state, WorkflowState::Completed);

    let new = ctx.snapshot("run-2").await;
    assert_eq!(new.execution_info.state, WorkflowState::Running);
    assert_eq!(new.execution_info.next_event_id, 2);
    assert_eq!(ctx.history_ids("run-2").await, vec![1]);

    let current = ctx
        .execution_store
        .get_current_execution(DOMAIN_ID, WORKFLOW_ID)
        .await
        .unwrap();
    assert_eq!(current.run_id, "run-2");
}

#[tokio::test]
async fn test_notify_adjusts_standby_clock_and_wakes_processors() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;

    let last_event_time = ctx.history(RUN_ID).await[0].timestamp;
    let standby = ctx
        .shard
        .current_time(REMOTE_CLUSTER)
        .expect("standby clock set");
    assert_eq!(standby, last_event_time - chrono::Duration::seconds(300));

    assert!(!ctx.notifier.timer.lock().unwrap().is_empty());
}
