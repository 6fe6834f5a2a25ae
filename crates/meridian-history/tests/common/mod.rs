// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for replication integration tests.
//!
//! Provides a TestContext wiring the replicator to in-memory stores and a
//! two-cluster replication group, plus history-event factories.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use meridian_history::cluster::{ClusterInfo, ClusterMetadata};
use meridian_history::config::Config;
use meridian_history::persistence::{
    ExecutionStore, HistoryStore, MemoryExecutionStore, MemoryHistoryStore, TimerTask,
    TransferTask, UpdateWorkflowExecutionRequest, WorkflowSnapshot,
};
use meridian_history::replicator::HistoryReplicator;
use meridian_history::shard::{Notifier, ShardContext};
use meridian_history::ExecutionCache;
use meridian_protocol::events::{EventAttributes, TimeoutType};
use meridian_protocol::{
    EventStoreVersion, HistoryEvent, ReplicateEventsRequest, ReplicationInfo, SyncActivityRequest,
    WorkflowExecution,
};

/// Local (standby) cluster in every test.
pub const LOCAL_CLUSTER: &str = "dc-east";

/// Remote (active) cluster in every test.
pub const REMOTE_CLUSTER: &str = "dc-west";

pub const DOMAIN_ID: &str = "d1";
pub const WORKFLOW_ID: &str = "wf-1";
pub const RUN_ID: &str = "run-1";

static INIT_TRACING: Once = Once::new();

/// Route replicator logs to the test writer, honoring `RUST_LOG`.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Notifier recording every notification for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub transfer: Mutex<Vec<(String, Vec<TransferTask>)>>,
    pub timer: Mutex<Vec<(String, DateTime<Utc>, Vec<TimerTask>)>>,
}

impl Notifier for RecordingNotifier {
    fn notify_transfer_tasks(&self, cluster: &str, tasks: &[TransferTask]) {
        self.transfer
            .lock()
            .unwrap()
            .push((cluster.to_string(), tasks.to_vec()));
    }

    fn notify_timer_tasks(&self, cluster: &str, now: DateTime<Utc>, tasks: &[TimerTask]) {
        self.timer
            .lock()
            .unwrap()
            .push((cluster.to_string(), now, tasks.to_vec()));
    }
}

/// Test context wiring the replicator to in-memory storage.
pub struct TestContext {
    pub shard: Arc<ShardContext>,
    pub cluster_metadata: Arc<ClusterMetadata>,
    pub execution_store: Arc<MemoryExecutionStore>,
    pub history_store: Arc<MemoryHistoryStore>,
    pub cache: Arc<ExecutionCache>,
    pub notifier: Arc<RecordingNotifier>,
    pub replicator: HistoryReplicator,
    pub token: CancellationToken,
}

impl TestContext {
    /// Two clusters, failover increment 10: dc-east authors versions
    /// congruent to 0, dc-west congruent to 1. dc-east is local.
    pub fn new() -> Self {
        init_tracing();

        let execution_store = Arc::new(MemoryExecutionStore::new());
        let history_store = Arc::new(MemoryHistoryStore::new());
        let execution_store_dyn: Arc<dyn ExecutionStore> = execution_store.clone();
        let history_store_dyn: Arc<dyn HistoryStore> = history_store.clone();

        let cluster_metadata = Arc::new(
            ClusterMetadata::new(
                10,
                LOCAL_CLUSTER,
                vec![
                    ClusterInfo {
                        name: LOCAL_CLUSTER.to_string(),
                        initial_failover_version: 0,
                    },
                    ClusterInfo {
                        name: REMOTE_CLUSTER.to_string(),
                        initial_failover_version: 1,
                    },
                ],
            )
            .expect("cluster metadata"),
        );

        let shard = Arc::new(ShardContext::new(1, 0));
        let cache = Arc::new(ExecutionCache::new(
            Arc::clone(&shard),
            Arc::clone(&execution_store_dyn),
            Arc::clone(&history_store_dyn),
            LOCAL_CLUSTER,
            16,
            64,
            Duration::from_secs(3600),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let replicator = HistoryReplicator::new(
            Arc::clone(&shard),
            Arc::clone(&cache),
            Arc::clone(&cluster_metadata),
            execution_store_dyn,
            history_store_dyn,
            Arc::new(Config::default()),
            notifier.clone(),
        );

        Self {
            shard,
            cluster_metadata,
            execution_store,
            history_store,
            cache,
            notifier,
            replicator,
            token: CancellationToken::new(),
        }
    }

    /// Build a decoded replication request for `run_id` from an ordered
    /// batch. Version and event-id bounds are derived from the events.
    pub fn replicate_request(
        &self,
        run_id: &str,
        events: Vec<HistoryEvent>,
        replication_info: HashMap<String, ReplicationInfo>,
        force_buffer_events: bool,
    ) -> ReplicateEventsRequest {
        let version = events[0].version;
        let first_event_id = events[0].event_id;
        let next_event_id = events[events.len() - 1].event_id + 1;
        ReplicateEventsRequest {
            source_cluster: self
                .cluster_metadata
                .cluster_name_for_version(version)
                .to_string(),
            domain_id: DOMAIN_ID.to_string(),
            execution: WorkflowExecution {
                workflow_id: WORKFLOW_ID.to_string(),
                run_id: run_id.to_string(),
            },
            first_event_id,
            next_event_id,
            version,
            replication_info,
            history: events,
            new_run_history: Vec::new(),
            event_store_version: EventStoreVersion::V2,
            new_run_event_store_version: EventStoreVersion::V2,
            force_buffer_events,
            reset_workflow: false,
        }
    }

    /// Apply a batch for `run_id`, expecting success.
    pub async fn apply(&self, run_id: &str, events: Vec<HistoryEvent>) {
        let request = self.replicate_request(run_id, events, HashMap::new(), true);
        self.replicator
            .apply_events(&self.token, &request, false)
            .await
            .expect("apply_events");
    }

    /// Load the persisted snapshot of a run.
    pub async fn snapshot(&self, run_id: &str) -> WorkflowSnapshot {
        self.execution_store
            .get_workflow_execution(DOMAIN_ID, WORKFLOW_ID, run_id)
            .await
            .expect("snapshot")
    }

    /// Conditionally replace a run's snapshot (test surgery), then drop the
    /// replicator's cached mutable state so the change is observed.
    pub async fn overwrite_snapshot(&self, snapshot: WorkflowSnapshot) {
        let run_id = snapshot.execution_info.run_id.clone();
        let condition = {
            let stored = self.snapshot(&run_id).await;
            stored.execution_info.next_event_id
        };
        self.execution_store
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot,
                condition_next_event_id: condition,
                transfer_tasks: Vec::new(),
                timer_tasks: Vec::new(),
            })
            .await
            .expect("overwrite snapshot");

        let acquired = self
            .cache
            .acquire(&self.token, DOMAIN_ID, WORKFLOW_ID, Some(&run_id))
            .await
            .expect("acquire for invalidation");
        let invalidate: Result<(), meridian_history::ReplicationError> =
            Err(meridian_history::ReplicationError::EmptyEventBatch);
        acquired.release(&invalidate);
    }

    /// Read a run's full history through its current v2 branch.
    pub async fn history(&self, run_id: &str) -> Vec<HistoryEvent> {
        let snapshot = self.snapshot(run_id).await;
        let branch_token = snapshot
            .execution_info
            .branch_token
            .expect("v2 branch token");
        self.history_store
            .read_history_branch(&branch_token, 1, i64::MAX)
            .await
            .expect("read branch")
    }

    /// Event ids of a run's history, in order.
    pub async fn history_ids(&self, run_id: &str) -> Vec<i64> {
        self.history(run_id)
            .await
            .iter()
            .map(|event| event.event_id)
            .collect()
    }
}

// ============================================================================
// History-event factories
// ============================================================================

pub fn event(event_id: i64, version: i64, attributes: EventAttributes) -> HistoryEvent {
    HistoryEvent {
        event_id,
        version,
        timestamp: Utc::now(),
        attributes,
    }
}

pub fn started(event_id: i64, version: i64) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::WorkflowExecutionStarted {
            workflow_type: "order-processing".to_string(),
            task_list: "orders".to_string(),
            input: None,
            execution_start_to_close_timeout_seconds: 300,
            task_start_to_close_timeout_seconds: 10,
            continued_execution_run_id: None,
            parent: None,
        },
    )
}

pub fn decision_scheduled(event_id: i64, version: i64) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::DecisionTaskScheduled {
            task_list: "orders".to_string(),
            start_to_close_timeout_seconds: 10,
            attempt: 0,
        },
    )
}

pub fn decision_started(event_id: i64, version: i64, scheduled_event_id: i64) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::DecisionTaskStarted {
            scheduled_event_id,
            identity: "worker-1".to_string(),
            request_id: "req-1".to_string(),
        },
    )
}

pub fn decision_completed(
    event_id: i64,
    version: i64,
    scheduled_event_id: i64,
    started_event_id: i64,
) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::DecisionTaskCompleted {
            scheduled_event_id,
            started_event_id,
            identity: "worker-1".to_string(),
        },
    )
}

pub fn activity_scheduled(
    event_id: i64,
    version: i64,
    decision_task_completed_event_id: i64,
) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::ActivityTaskScheduled {
            activity_id: "a1".to_string(),
            activity_type: "charge-card".to_string(),
            task_list: "orders".to_string(),
            input: None,
            schedule_to_start_timeout_seconds: 10,
            schedule_to_close_timeout_seconds: 60,
            start_to_close_timeout_seconds: 30,
            heartbeat_timeout_seconds: 5,
            decision_task_completed_event_id,
        },
    )
}

pub fn activity_started(event_id: i64, version: i64, scheduled_event_id: i64) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::ActivityTaskStarted {
            scheduled_event_id,
            identity: "worker-1".to_string(),
            attempt: 0,
        },
    )
}

pub fn signaled(event_id: i64, version: i64, signal_name: &str) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.to_string(),
            input: Some(b"payload".to_vec()),
            identity: "external".to_string(),
        },
    )
}

pub fn continued_as_new(event_id: i64, version: i64, new_run_id: &str) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::WorkflowExecutionContinuedAsNew {
            new_execution_run_id: new_run_id.to_string(),
            workflow_type: "order-processing".to_string(),
            task_list: "orders".to_string(),
            decision_task_completed_event_id: event_id - 1,
        },
    )
}

pub fn activity_timed_out(event_id: i64, version: i64, scheduled_event_id: i64) -> HistoryEvent {
    event(
        event_id,
        version,
        EventAttributes::ActivityTaskTimedOut {
            scheduled_event_id,
            started_event_id: scheduled_event_id + 1,
            timeout_type: TimeoutType::StartToClose,
        },
    )
}

/// Minimal sync-activity request; callers override timing fields.
pub fn sync_activity_request(
    run_id: &str,
    version: i64,
    scheduled_id: i64,
    attempt: i32,
    last_heartbeat_time: Option<DateTime<Utc>>,
) -> SyncActivityRequest {
    SyncActivityRequest {
        domain_id: DOMAIN_ID.to_string(),
        workflow_id: WORKFLOW_ID.to_string(),
        run_id: run_id.to_string(),
        version,
        scheduled_id,
        scheduled_time: None,
        started_id: scheduled_id + 1,
        started_time: None,
        last_heartbeat_time,
        attempt,
        details: Some(b"progress".to_vec()),
    }
}
