// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History event model.
//!
//! A workflow run's history is an append-only list of [`HistoryEvent`]s. The
//! event id is 1-based and gap-free per run; the failover version encodes the
//! cluster that authored the event. Type-specific payloads live in
//! [`EventAttributes`]; the discriminant is recoverable via
//! [`HistoryEvent::event_type`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Discriminant of a history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum EventType {
    /// First event of every run.
    WorkflowExecutionStarted,
    /// Run completed successfully.
    WorkflowExecutionCompleted,
    /// Run failed.
    WorkflowExecutionFailed,
    /// Run exceeded its execution timeout.
    WorkflowExecutionTimedOut,
    /// Run was terminated, either by an operator or by conflict resolution.
    WorkflowExecutionTerminated,
    /// External signal delivered to the run.
    WorkflowExecutionSignaled,
    /// Run closed and immediately restarted under a new run id.
    WorkflowExecutionContinuedAsNew,
    /// Decision task placed on the task list.
    DecisionTaskScheduled,
    /// Decision task picked up by a worker.
    DecisionTaskStarted,
    /// Decision task completed by a worker.
    DecisionTaskCompleted,
    /// Decision task failed.
    DecisionTaskFailed,
    /// Decision task timed out.
    DecisionTaskTimedOut,
    /// Activity task scheduled by a completed decision.
    ActivityTaskScheduled,
    /// Activity task picked up by a worker.
    ActivityTaskStarted,
    /// Activity task completed.
    ActivityTaskCompleted,
    /// Activity task failed.
    ActivityTaskFailed,
    /// Activity task timed out.
    ActivityTaskTimedOut,
    /// User timer started.
    TimerStarted,
    /// User timer fired.
    TimerFired,
}

/// Why a decision task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionTaskFailedCause {
    /// Worker produced an unhandled decision.
    UnhandledDecision,
    /// Synthetic failure injected to flush buffered events across a failover.
    FailoverCloseDecision,
    /// Decision discarded because the workflow was reset.
    ResetWorkflow,
}

/// Which timeout fired for a timed-out task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    /// Task started but did not finish in time.
    StartToClose,
    /// Task was never picked up.
    ScheduleToStart,
    /// Task did not finish within its overall deadline.
    ScheduleToClose,
    /// Activity stopped heartbeating.
    Heartbeat,
}

/// Identifies the parent workflow execution for child workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentExecutionInfo {
    /// Domain of the parent execution.
    pub domain_id: String,
    /// Workflow id of the parent execution.
    pub workflow_id: String,
    /// Run id of the parent execution.
    pub run_id: String,
    /// Event id of the parent's child-initiated event.
    pub initiated_id: i64,
}

/// Type-specific payload of a history event.
///
/// The serialized representation tags each variant with its event type so
/// peers can decode batches without out-of-band schema knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type")]
#[allow(missing_docs)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: Option<Vec<u8>>,
        execution_start_to_close_timeout_seconds: i32,
        task_start_to_close_timeout_seconds: i32,
        /// Set when this run was started by continue-as-new of a prior run.
        continued_execution_run_id: Option<String>,
        parent: Option<ParentExecutionInfo>,
    },
    WorkflowExecutionCompleted {
        result: Option<Vec<u8>>,
        decision_task_completed_event_id: i64,
    },
    WorkflowExecutionFailed {
        reason: Option<String>,
        details: Option<Vec<u8>>,
        decision_task_completed_event_id: i64,
    },
    WorkflowExecutionTimedOut {
        timeout_type: TimeoutType,
    },
    WorkflowExecutionTerminated {
        reason: String,
        identity: String,
        details: Option<Vec<u8>>,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Option<Vec<u8>>,
        identity: String,
    },
    WorkflowExecutionContinuedAsNew {
        new_execution_run_id: String,
        workflow_type: String,
        task_list: String,
        decision_task_completed_event_id: i64,
    },
    DecisionTaskScheduled {
        task_list: String,
        start_to_close_timeout_seconds: i32,
        attempt: i64,
    },
    DecisionTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
    },
    DecisionTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        identity: String,
    },
    DecisionTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        cause: DecisionTaskFailedCause,
        identity: String,
    },
    DecisionTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_type: TimeoutType,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: String,
        task_list: String,
        input: Option<Vec<u8>>,
        schedule_to_start_timeout_seconds: i32,
        schedule_to_close_timeout_seconds: i32,
        start_to_close_timeout_seconds: i32,
        heartbeat_timeout_seconds: i32,
        decision_task_completed_event_id: i64,
    },
    ActivityTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        attempt: i32,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        result: Option<Vec<u8>>,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        reason: Option<String>,
        details: Option<Vec<u8>>,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: i64,
        started_event_id: i64,
        timeout_type: TimeoutType,
    },
    TimerStarted {
        timer_id: String,
        start_to_fire_timeout_seconds: i64,
        decision_task_completed_event_id: i64,
    },
    TimerFired {
        timer_id: String,
        started_event_id: i64,
    },
}

impl EventAttributes {
    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                EventType::WorkflowExecutionCompleted
            }
            EventAttributes::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            EventAttributes::WorkflowExecutionTimedOut { .. } => {
                EventType::WorkflowExecutionTimedOut
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                EventType::WorkflowExecutionTerminated
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                EventType::WorkflowExecutionSignaled
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            EventAttributes::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
            EventAttributes::DecisionTaskStarted { .. } => EventType::DecisionTaskStarted,
            EventAttributes::DecisionTaskCompleted { .. } => EventType::DecisionTaskCompleted,
            EventAttributes::DecisionTaskFailed { .. } => EventType::DecisionTaskFailed,
            EventAttributes::DecisionTaskTimedOut { .. } => EventType::DecisionTaskTimedOut,
            EventAttributes::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            EventAttributes::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            EventAttributes::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            EventAttributes::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            EventAttributes::ActivityTaskTimedOut { .. } => EventType::ActivityTaskTimedOut,
            EventAttributes::TimerStarted { .. } => EventType::TimerStarted,
            EventAttributes::TimerFired { .. } => EventType::TimerFired,
        }
    }
}

/// One entry in a workflow run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// 1-based position within the run. Gap-free per run.
    pub event_id: i64,
    /// Failover version of the authoring cluster. Non-decreasing within a run.
    pub version: i64,
    /// Wall time at which the authoring cluster recorded the event.
    pub timestamp: DateTime<Utc>,
    /// Type-specific payload.
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    /// The event type discriminant.
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }
}
