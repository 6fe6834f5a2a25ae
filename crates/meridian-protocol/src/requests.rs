// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Replication request payloads.
//!
//! These are the messages a standby cluster receives from its active peer:
//! raw (still-encoded) event batches, decoded event batches, and activity
//! state synchronization. Field semantics follow the replication contract;
//! transport framing is out of scope for this crate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blob::DataBlob;
use crate::events::HistoryEvent;

/// Which history storage layout a run's events live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EventStoreVersion {
    /// Flat per-execution event log.
    V1,
    /// Branched event log addressed by branch token.
    #[default]
    V2,
}

/// Identifies one workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// User-chosen workflow id, unique per domain among running executions.
    pub workflow_id: String,
    /// UUID of this particular run.
    pub run_id: String,
}

/// What one cluster has seen of another cluster's event stream.
///
/// Keyed by cluster name in request maps: `version` is the highest failover
/// version observed from that cluster, `last_event_id` the id of the last
/// event applied at that version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    /// Highest failover version observed.
    pub version: i64,
    /// Last event id applied at `version`.
    pub last_event_id: i64,
}

/// Replication task whose event batches are still encoded.
///
/// The receiver decodes `history` (and `new_run_history` when present) and
/// then processes the task as a [`ReplicateEventsRequest`] with buffering
/// forced on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateRawEventsRequest {
    /// Domain owning the execution.
    pub domain_id: String,
    /// Target workflow run.
    pub execution: WorkflowExecution,
    /// Encoded batch of history events, ordered by event id, single version.
    pub history: DataBlob,
    /// First batch of the successor run when the batch ends in
    /// continue-as-new.
    pub new_run_history: Option<DataBlob>,
    /// Source cluster's view of every peer's progress.
    pub replication_info: HashMap<String, ReplicationInfo>,
    /// Storage layout of the target run's history.
    pub event_store_version: EventStoreVersion,
    /// Storage layout of the successor run's history.
    pub new_run_event_store_version: EventStoreVersion,
    /// True when this task replays a workflow reset.
    pub reset_workflow: bool,
}

/// Replication task with decoded event batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateEventsRequest {
    /// Cluster that authored the batch.
    pub source_cluster: String,
    /// Domain owning the execution.
    pub domain_id: String,
    /// Target workflow run.
    pub execution: WorkflowExecution,
    /// Event id of the first event in `history`.
    pub first_event_id: i64,
    /// One past the event id of the last event in `history`.
    pub next_event_id: i64,
    /// Failover version shared by every event in `history`.
    pub version: i64,
    /// Source cluster's view of every peer's progress.
    pub replication_info: HashMap<String, ReplicationInfo>,
    /// Ordered batch of history events.
    pub history: Vec<HistoryEvent>,
    /// First batch of the successor run when the batch ends in
    /// continue-as-new.
    pub new_run_history: Vec<HistoryEvent>,
    /// Storage layout of the target run's history.
    pub event_store_version: EventStoreVersion,
    /// Storage layout of the successor run's history.
    pub new_run_event_store_version: EventStoreVersion,
    /// Buffer out-of-order batches instead of asking the sender to retry.
    pub force_buffer_events: bool,
    /// True when this task replays a workflow reset.
    pub reset_workflow: bool,
}

impl ReplicateEventsRequest {
    /// First event of the batch, if any.
    pub fn first_event(&self) -> Option<&HistoryEvent> {
        self.history.first()
    }

    /// Last event of the batch, if any.
    pub fn last_event(&self) -> Option<&HistoryEvent> {
        self.history.last()
    }
}

/// Activity heartbeat/state synchronization from the active cluster.
///
/// Sent when an activity with a retry policy starts or heartbeats; the
/// standby applies it to its activity info without any history event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncActivityRequest {
    /// Domain owning the execution.
    pub domain_id: String,
    /// User-chosen workflow id.
    pub workflow_id: String,
    /// Run id of the execution.
    pub run_id: String,
    /// Failover version the activity state was authored at.
    pub version: i64,
    /// Event id of the activity's scheduled event.
    pub scheduled_id: i64,
    /// When the activity was scheduled.
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Event id of the activity's started event, if started.
    pub started_id: i64,
    /// When the activity started.
    pub started_time: Option<DateTime<Utc>>,
    /// Most recent heartbeat time.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Retry attempt counter.
    pub attempt: i32,
    /// Latest heartbeat payload.
    pub details: Option<Vec<u8>>,
}
