// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for activity-state synchronization.

mod common;

use chrono::{Duration, Utc};
use common::*;
use meridian_history::{ReplicationError, RetryReason};

const V1: i64 = 11;

/// Run with activity 5 scheduled and started (events 1..6).
async fn run_with_started_activity(ctx: &TestContext) {
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;
    ctx.apply(
        RUN_ID,
        vec![
            decision_scheduled(2, V1),
            decision_started(3, V1, 2),
            decision_completed(4, V1, 2, 3),
            activity_scheduled(5, V1, 4),
            activity_started(6, V1, 5),
        ],
    )
    .await;
}

#[tokio::test]
async fn test_heartbeat_applies_and_persists() {
    let ctx = TestContext::new();
    run_with_started_activity(&ctx).await;

    let t0 = Utc::now();
    let request = sync_activity_request(RUN_ID, V1, 5, 0, Some(t0));
    ctx.replicator
        .sync_activity(&ctx.token, &request)
        .await
        .expect("heartbeat applies");

    let snapshot = ctx.snapshot(RUN_ID).await;
    let ai = &snapshot.activity_infos[&5];
    assert_eq!(ai.last_heartbeat_time, Some(t0));
    assert_eq!(ai.details, Some(b"progress".to_vec()));
    assert_eq!(ai.attempt, 0);
}

#[tokio::test]
async fn test_strictly_older_heartbeat_is_noop() {
    let ctx = TestContext::new();
    run_with_started_activity(&ctx).await;

    let t0 = Utc::now();
    ctx.replicator
        .sync_activity(&ctx.token, &sync_activity_request(RUN_ID, V1, 5, 0, Some(t0)))
        .await
        .expect("first heartbeat applies");

    // Same version, same attempt, heartbeat one second older: no-op.
    ctx.replicator
        .sync_activity(
            &ctx.token,
            &sync_activity_request(RUN_ID, V1, 5, 0, Some(t0 - Duration::seconds(1))),
        )
        .await
        .expect("older heartbeat is dropped as success");

    let snapshot = ctx.snapshot(RUN_ID).await;
    assert_eq!(snapshot.activity_infos[&5].last_heartbeat_time, Some(t0));
    assert_eq!(
        ctx.replicator.metrics().snapshot().sync_activity_dropped,
        1
    );
}

#[tokio::test]
async fn test_higher_attempt_applies_within_same_cluster() {
    let ctx = TestContext::new();
    run_with_started_activity(&ctx).await;

    let t0 = Utc::now();
    ctx.replicator
        .sync_activity(&ctx.token, &sync_activity_request(RUN_ID, V1, 5, 0, Some(t0)))
        .await
        .expect("first heartbeat applies");

    // Attempt advanced within the same cluster family: applied even though
    // the heartbeat time did not move.
    ctx.replicator
        .sync_activity(&ctx.token, &sync_activity_request(RUN_ID, V1, 5, 1, Some(t0)))
        .await
        .expect("retry attempt applies");

    let snapshot = ctx.snapshot(RUN_ID).await;
    let ai = &snapshot.activity_infos[&5];
    assert_eq!(ai.attempt, 1);
    assert_eq!(ai.last_heartbeat_time, Some(t0));
}

#[tokio::test]
async fn test_stale_version_dropped() {
    let ctx = TestContext::new();
    run_with_started_activity(&ctx).await;

    // Move the activity to version 21 first.
    let t0 = Utc::now();
    ctx.replicator
        .sync_activity(&ctx.token, &sync_activity_request(RUN_ID, 21, 5, 0, Some(t0)))
        .await
        .expect("newer version applies");

    // A version-11 sync is now stale.
    ctx.replicator
        .sync_activity(
            &ctx.token,
            &sync_activity_request(RUN_ID, V1, 5, 3, Some(t0 + Duration::seconds(5))),
        )
        .await
        .expect("stale version is dropped as success");

    let snapshot = ctx.snapshot(RUN_ID).await;
    let ai = &snapshot.activity_infos[&5];
    assert_eq!(ai.version, 21);
    assert_eq!(ai.attempt, 0);
}

#[tokio::test]
async fn test_sync_ahead_of_schedule_asks_for_retry() {
    let ctx = TestContext::new();
    ctx.apply(RUN_ID, vec![started(1, V1)]).await;

    // Schedule id 5 does not exist yet; the events must arrive first.
    let err = ctx
        .replicator
        .sync_activity(
            &ctx.token,
            &sync_activity_request(RUN_ID, V1, 5, 0, Some(Utc::now())),
        )
        .await
        .expect_err("must ask for retry");
    match err {
        ReplicationError::RetryTask {
            reason,
            next_event_id,
            ..
        } => {
            assert_eq!(reason, RetryReason::SyncActivity);
            assert_eq!(next_event_id, Some(2));
        }
        other => panic!("expected RetryTask, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sync_for_finished_activity_dropped() {
    let ctx = TestContext::new();
    run_with_started_activity(&ctx).await;
    ctx.apply(RUN_ID, vec![activity_timed_out(7, V1, 5)]).await;

    ctx.replicator
        .sync_activity(
            &ctx.token,
            &sync_activity_request(RUN_ID, V1, 5, 0, Some(Utc::now())),
        )
        .await
        .expect("sync for finished activity is dropped as success");

    let snapshot = ctx.snapshot(RUN_ID).await;
    assert!(!snapshot.activity_infos.contains_key(&5));
}

#[tokio::test]
async fn test_sync_for_unknown_run_dropped() {
    let ctx = TestContext::new();

    ctx.replicator
        .sync_activity(
            &ctx.token,
            &sync_activity_request("run-gone", V1, 5, 0, Some(Utc::now())),
        )
        .await
        .expect("sync for unknown run is dropped as success");
}
