// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for history replication.
//!
//! This module defines the storage abstraction the replicator drives: a
//! conditional-write execution store (one mutable-state snapshot per run,
//! fenced by `next_event_id`) and an append-only history store with two
//! layouts (v1 flat per-execution log, v2 branched log addressed by branch
//! token). Storage is authoritative; in-memory mutable state is a cache
//! synchronized through the conditional writes declared here.

pub mod memory;

pub use self::memory::{MemoryExecutionStore, MemoryHistoryStore};

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use meridian_protocol::events::TimeoutType;
use meridian_protocol::{EventStoreVersion, HistoryEvent, ReplicationInfo, WorkflowExecution};

/// Mint a fresh history branch token.
pub fn new_branch_token() -> Bytes {
    Bytes::copy_from_slice(Uuid::new_v4().as_bytes())
}

/// Event id of the first event in every run.
pub const FIRST_EVENT_ID: i64 = 1;

/// Sentinel for "no event".
pub const EMPTY_EVENT_ID: i64 = 0;

/// Lifecycle state of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Execution row exists but the run has not progressed.
    Created,
    /// Run is open and may accept events.
    Running,
    /// Run reached a terminal event.
    Completed,
}

/// How a closed workflow execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    /// Run is still open.
    None,
    /// Completed successfully.
    Completed,
    /// Failed.
    Failed,
    /// Canceled by request.
    Canceled,
    /// Terminated by operator or conflict resolution.
    Terminated,
    /// Closed by continue-as-new; a successor run exists.
    ContinuedAsNew,
    /// Exceeded its execution timeout.
    TimedOut,
}

/// Lineage marker recorded when a v1 history log is rewound.
///
/// v1 has no branch tokens; abandoned events stay in the log and are
/// superseded by later appends at a higher version. The marker records where
/// the authoritative lineage ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetMarker {
    /// Last event id of the authoritative lineage.
    pub last_event_id: i64,
    /// Version the rewind was performed at.
    pub version: i64,
}

/// Execution metadata persisted per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionInfo {
    /// Domain owning the execution.
    pub domain_id: String,
    /// User-chosen workflow id.
    pub workflow_id: String,
    /// UUID of this run.
    pub run_id: String,
    /// Parent domain for child workflows.
    pub parent_domain_id: Option<String>,
    /// Parent workflow id for child workflows.
    pub parent_workflow_id: Option<String>,
    /// Parent run id for child workflows.
    pub parent_run_id: Option<String>,
    /// Event id of the parent's child-initiated event.
    pub initiated_id: i64,
    /// Task list the run's tasks are dispatched to.
    pub task_list: String,
    /// Workflow type name.
    pub workflow_type_name: String,
    /// Execution start-to-close timeout.
    pub workflow_timeout_seconds: i32,
    /// Decision start-to-close timeout.
    pub decision_timeout_seconds: i32,
    /// Lifecycle state.
    pub state: WorkflowState,
    /// How the run closed, when closed.
    pub close_status: CloseStatus,
    /// Id the next appended event will take. Always last persisted id + 1.
    pub next_event_id: i64,
    /// First event id of the most recently appended batch.
    pub last_first_event_id: i64,
    /// Idempotency key of the request that created this run.
    pub create_request_id: String,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// Accumulated size of the run's persisted history, in bytes.
    pub history_size: i64,
    /// Storage layout of this run's history.
    pub event_store_version: EventStoreVersion,
    /// Current history branch. Present iff `event_store_version` is v2.
    pub branch_token: Option<Bytes>,
    /// Lineage marker of the last v1 rewind, if any.
    pub reset_marker: Option<ResetMarker>,
}

/// Per-run replication bookkeeping, persisted with the execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Version the run is currently being mutated at.
    pub current_version: i64,
    /// Version of the run's start event.
    pub start_version: i64,
    /// Version of the last persisted write.
    pub last_write_version: i64,
    /// Event id of the last persisted write.
    pub last_write_event_id: i64,
    /// Per peer cluster: the highest (version, last event id) this cluster
    /// has applied from that peer. Entries are monotone non-decreasing.
    pub last_replication_info: HashMap<String, ReplicationInfo>,
}

/// In-flight decision task, at most one per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionInfo {
    /// Version the decision was scheduled at.
    pub version: i64,
    /// Event id of the scheduled event.
    pub schedule_id: i64,
    /// Event id of the started event, or [`EMPTY_EVENT_ID`].
    pub started_id: i64,
    /// Request id of the started decision.
    pub request_id: String,
    /// Start-to-close timeout.
    pub decision_timeout_seconds: i32,
    /// Scheduling attempt.
    pub attempt: i64,
}

/// Timer-task creation flags on an activity. Bits record which timeout
/// timers have already been created so replication does not double-create
/// them.
pub mod timer_task_status {
    /// No timer tasks created.
    pub const NONE: i32 = 0;
    /// Start-to-close timer created.
    pub const CREATED_START_TO_CLOSE: i32 = 1;
    /// Schedule-to-close timer created.
    pub const CREATED_SCHEDULE_TO_CLOSE: i32 = 2;
    /// Heartbeat timer created.
    pub const CREATED_HEARTBEAT: i32 = 4;
}

/// In-flight activity, keyed by its scheduled event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityInfo {
    /// Version the activity state was last written at.
    pub version: i64,
    /// Event id of the scheduled event.
    pub schedule_id: i64,
    /// When the activity was scheduled.
    pub scheduled_time: DateTime<Utc>,
    /// Event id of the started event, or [`EMPTY_EVENT_ID`].
    pub started_id: i64,
    /// When the activity started.
    pub started_time: Option<DateTime<Utc>>,
    /// User-chosen activity id.
    pub activity_id: String,
    /// Latest heartbeat payload.
    pub details: Option<Vec<u8>>,
    /// Most recent heartbeat time.
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    /// Retry attempt counter.
    pub attempt: i32,
    /// Which timeout timers exist; see [`timer_task_status`].
    pub timer_task_status: i32,
    /// Schedule-to-start timeout.
    pub schedule_to_start_timeout_seconds: i32,
    /// Schedule-to-close timeout.
    pub schedule_to_close_timeout_seconds: i32,
    /// Start-to-close timeout.
    pub start_to_close_timeout_seconds: i32,
    /// Heartbeat timeout. Zero disables heartbeat monitoring.
    pub heartbeat_timeout_seconds: i32,
}

/// An out-of-order replication batch parked until the event-id gap closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedReplicationTask {
    /// Event id of the batch's first event. Also the buffer key.
    pub first_event_id: i64,
    /// One past the batch's last event id.
    pub next_event_id: i64,
    /// Version shared by the batch's events.
    pub version: i64,
    /// The batch itself.
    pub events: Vec<HistoryEvent>,
    /// First batch of the successor run for continue-as-new batches.
    pub new_run_events: Vec<HistoryEvent>,
    /// Storage layout of the target run's history.
    pub event_store_version: EventStoreVersion,
    /// Storage layout of the successor run's history.
    pub new_run_event_store_version: EventStoreVersion,
}

/// Full mutable-state snapshot persisted per workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    /// Execution metadata.
    pub execution_info: WorkflowExecutionInfo,
    /// Replication bookkeeping.
    pub replication_state: ReplicationState,
    /// In-flight activities keyed by scheduled event id.
    pub activity_infos: HashMap<i64, ActivityInfo>,
    /// In-flight decision, at most one.
    pub pending_decision: Option<DecisionInfo>,
    /// Events accepted but not yet assigned ids (active-side buffering).
    pub buffered_events: Vec<HistoryEvent>,
    /// Out-of-order replication batches keyed by first event id.
    pub buffered_replication_tasks: HashMap<i64, BufferedReplicationTask>,
}

/// Work handed to the transfer-queue processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Version of the event that produced the task.
    pub version: i64,
    /// When the task becomes visible to the processor.
    pub visibility_time: DateTime<Utc>,
    /// What to do.
    pub kind: TransferTaskKind,
}

/// Transfer-task payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransferTaskKind {
    /// Dispatch a decision task.
    DecisionTask {
        /// Scheduled event id.
        schedule_id: i64,
        /// Target task list.
        task_list: String,
    },
    /// Dispatch an activity task.
    ActivityTask {
        /// Scheduled event id.
        schedule_id: i64,
        /// Target task list.
        task_list: String,
    },
    /// Run close bookkeeping (visibility, parent notification).
    CloseExecution,
}

/// Work handed to the timer-queue processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTask {
    /// Version of the event that produced the task.
    pub version: i64,
    /// When the timer fires.
    pub visibility_time: DateTime<Utc>,
    /// What to do.
    pub kind: TimerTaskKind,
}

/// Timer-task payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimerTaskKind {
    /// Decision task start-to-close timeout.
    DecisionTimeout {
        /// Scheduled event id.
        schedule_id: i64,
    },
    /// Activity timeout of the given type.
    ActivityTimeout {
        /// Scheduled event id.
        schedule_id: i64,
        /// Which timeout is being enforced.
        timeout_type: TimeoutType,
    },
    /// Whole-run execution timeout.
    WorkflowTimeout,
    /// User timer.
    UserTimer {
        /// Event id of the timer-started event.
        started_event_id: i64,
    },
}

/// How a new execution row is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CreateWorkflowMode {
    /// Fail if any execution row exists for the workflow id.
    BrandNew,
    /// Replace the current-run pointer of a closed predecessor.
    WorkflowIdReuse {
        /// Run the pointer must currently name.
        prev_run_id: String,
        /// Last write version the predecessor closed at.
        prev_last_write_version: i64,
    },
}

/// Request to create a workflow execution row.
#[derive(Debug, Clone)]
pub struct CreateWorkflowExecutionRequest {
    /// Creation mode.
    pub mode: CreateWorkflowMode,
    /// Initial snapshot.
    pub snapshot: WorkflowSnapshot,
    /// Transfer tasks produced by the first batch.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks produced by the first batch.
    pub timer_tasks: Vec<TimerTask>,
}

/// Request to conditionally replace a workflow execution row.
#[derive(Debug, Clone)]
pub struct UpdateWorkflowExecutionRequest {
    /// Replacement snapshot.
    pub snapshot: WorkflowSnapshot,
    /// Fence: the stored snapshot's `next_event_id` must equal this.
    pub condition_next_event_id: i64,
    /// Transfer tasks produced by the applied batch.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks produced by the applied batch.
    pub timer_tasks: Vec<TimerTask>,
}

/// Answer to a current-execution lookup.
#[derive(Debug, Clone)]
pub struct CurrentExecution {
    /// Run the current pointer names.
    pub run_id: String,
    /// Lifecycle state of that run.
    pub state: WorkflowState,
    /// Close status of that run.
    pub close_status: CloseStatus,
    /// Last write version of that run.
    pub last_write_version: i64,
}

/// Request to append a batch to a v1 (flat) history log.
#[derive(Debug, Clone)]
pub struct AppendHistoryEventsRequest {
    /// Domain owning the execution.
    pub domain_id: String,
    /// Target run.
    pub execution: WorkflowExecution,
    /// Event id of the batch's first event.
    pub first_event_id: i64,
    /// Version shared by the batch's events.
    pub event_batch_version: i64,
    /// Transaction id allocated from the shard's sequencer.
    pub transaction_id: i64,
    /// The batch.
    pub events: Vec<HistoryEvent>,
}

/// Request to append a batch to a v2 (branched) history log.
#[derive(Debug, Clone)]
pub struct AppendHistoryNodesRequest {
    /// Target branch.
    pub branch_token: Bytes,
    /// Whether this append creates the branch.
    pub is_new_branch: bool,
    /// Transaction id allocated from the shard's sequencer.
    pub transaction_id: i64,
    /// The batch.
    pub events: Vec<HistoryEvent>,
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// An execution row for the workflow id is in the way.
    #[error("workflow execution already started: current run {run_id}")]
    ExecutionAlreadyStarted {
        /// Run the current pointer names.
        run_id: String,
        /// Lifecycle state of that run.
        state: WorkflowState,
        /// Close status of that run.
        close_status: CloseStatus,
        /// Last write version of that run.
        last_write_version: i64,
    },

    /// The conditional write's fence did not match the stored row.
    #[error("conditional update failed: expected next event id {expected}, found {actual}")]
    ConditionFailed {
        /// Fence the caller supplied.
        expected: i64,
        /// `next_event_id` actually stored.
        actual: i64,
    },

    /// No execution row for the given identifiers.
    #[error("workflow execution not found: workflow {workflow_id} run {run_id:?}")]
    ExecutionNotFound {
        /// Workflow id looked up.
        workflow_id: String,
        /// Run id looked up; `None` for current-run lookups.
        run_id: Option<String>,
    },

    /// No history branch for the given token.
    #[error("history branch not found")]
    BranchNotFound,

    /// Backend unavailable or misbehaving.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Conditional-write execution store, one snapshot per workflow run.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Create an execution row and point the workflow id's current-run
    /// pointer at it. Fails with [`StoreError::ExecutionAlreadyStarted`]
    /// when another row is in the way.
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    /// Load the snapshot of one run.
    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowSnapshot, StoreError>;

    /// Conditionally replace the snapshot of one run. Fails with
    /// [`StoreError::ConditionFailed`] when the fence mismatches; the caller
    /// must reload mutable state and retry.
    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError>;

    /// Resolve the workflow id's current run.
    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, StoreError>;
}

/// Append-only history store with v1 (flat) and v2 (branched) layouts.
///
/// Callers must branch on the layout only at the append sites and the
/// delete-history site; reads go through the layout-specific method matching
/// the run's `event_store_version`.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a batch to a v1 log. Returns the batch's stored size in bytes.
    /// A batch at the same first event id with a higher version supersedes
    /// the stored one.
    async fn append_history_events(
        &self,
        request: AppendHistoryEventsRequest,
    ) -> Result<usize, StoreError>;

    /// Append a batch to a v2 branch. Returns the batch's stored size in
    /// bytes.
    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> Result<usize, StoreError>;

    /// Read `[first_event_id, next_event_id)` from a v1 log.
    async fn read_history_events(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Read `[first_event_id, next_event_id)` from a v2 branch.
    async fn read_history_branch(
        &self,
        branch_token: &Bytes,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Copy events below `fork_event_id` into a fresh branch and return its
    /// token.
    async fn fork_history_branch(
        &self,
        branch_token: &Bytes,
        fork_event_id: i64,
    ) -> Result<Bytes, StoreError>;

    /// Drop the whole v1 log of one run.
    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError>;

    /// Drop one v2 branch.
    async fn delete_history_branch(&self, branch_token: &Bytes) -> Result<(), StoreError>;
}
