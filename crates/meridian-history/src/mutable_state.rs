// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory materialization of one workflow run.
//!
//! [`MutableState`] mirrors the persisted snapshot of a run and is mutated
//! only by the exclusive holder of the run's execution context. Persistence
//! happens through the context's update operations, which fence every write
//! on the `next_event_id` captured when the state was loaded.

use std::collections::HashMap;

use chrono::Utc;

use meridian_protocol::events::{DecisionTaskFailedCause, EventAttributes};
use meridian_protocol::{
    EventStoreVersion, HistoryEvent, ReplicateEventsRequest, SyncActivityRequest,
};

use crate::cluster::EMPTY_VERSION;
use crate::error::ReplicationError;
use crate::persistence::new_branch_token;
use crate::persistence::{
    timer_task_status, ActivityInfo, BufferedReplicationTask, CloseStatus, DecisionInfo,
    ReplicationState, WorkflowExecutionInfo, WorkflowSnapshot, WorkflowState, EMPTY_EVENT_ID,
    FIRST_EVENT_ID,
};

/// Mutable state of one workflow run.
#[derive(Debug, Clone)]
pub struct MutableState {
    /// Execution metadata.
    pub execution_info: WorkflowExecutionInfo,
    /// Replication bookkeeping.
    pub replication_state: ReplicationState,
    /// In-flight activities keyed by scheduled event id.
    pub activity_infos: HashMap<i64, ActivityInfo>,
    /// In-flight decision, at most one.
    pub pending_decision: Option<DecisionInfo>,
    /// Events accepted but not yet assigned event ids.
    pub buffered_events: Vec<HistoryEvent>,
    /// Out-of-order replication batches keyed by first event id.
    pub buffered_replication_tasks: HashMap<i64, BufferedReplicationTask>,

    /// Locally authored events awaiting persistence.
    pending_events: Vec<HistoryEvent>,
    /// Conditional-write fence captured at load/create time.
    condition: i64,
    /// Name of the cluster this process runs in.
    current_cluster: String,
}

impl MutableState {
    /// Fresh mutable state for a run being created by replication at
    /// `version`.
    pub fn new_for_replication(current_cluster: &str, version: i64) -> Self {
        Self {
            execution_info: WorkflowExecutionInfo {
                domain_id: String::new(),
                workflow_id: String::new(),
                run_id: String::new(),
                parent_domain_id: None,
                parent_workflow_id: None,
                parent_run_id: None,
                initiated_id: EMPTY_EVENT_ID,
                task_list: String::new(),
                workflow_type_name: String::new(),
                workflow_timeout_seconds: 0,
                decision_timeout_seconds: 0,
                state: WorkflowState::Created,
                close_status: CloseStatus::None,
                next_event_id: FIRST_EVENT_ID,
                last_first_event_id: EMPTY_EVENT_ID,
                create_request_id: String::new(),
                start_time: Utc::now(),
                history_size: 0,
                event_store_version: EventStoreVersion::default(),
                branch_token: None,
                reset_marker: None,
            },
            replication_state: ReplicationState {
                current_version: version,
                start_version: version,
                last_write_version: EMPTY_VERSION,
                last_write_event_id: EMPTY_EVENT_ID,
                last_replication_info: HashMap::new(),
            },
            activity_infos: HashMap::new(),
            pending_decision: None,
            buffered_events: Vec::new(),
            buffered_replication_tasks: HashMap::new(),
            pending_events: Vec::new(),
            condition: FIRST_EVENT_ID,
            current_cluster: current_cluster.to_string(),
        }
    }

    /// Rehydrate mutable state from a persisted snapshot.
    pub fn from_snapshot(current_cluster: &str, snapshot: WorkflowSnapshot) -> Self {
        let condition = snapshot.execution_info.next_event_id;
        Self {
            execution_info: snapshot.execution_info,
            replication_state: snapshot.replication_state,
            activity_infos: snapshot.activity_infos,
            pending_decision: snapshot.pending_decision,
            buffered_events: snapshot.buffered_events,
            buffered_replication_tasks: snapshot.buffered_replication_tasks,
            pending_events: Vec::new(),
            condition,
            current_cluster: current_cluster.to_string(),
        }
    }

    /// Snapshot of the current state, for persistence.
    pub fn to_snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            execution_info: self.execution_info.clone(),
            replication_state: self.replication_state.clone(),
            activity_infos: self.activity_infos.clone(),
            pending_decision: self.pending_decision.clone(),
            buffered_events: self.buffered_events.clone(),
            buffered_replication_tasks: self.buffered_replication_tasks.clone(),
        }
    }

    /// The conditional-write fence captured at load time.
    pub fn condition(&self) -> i64 {
        self.condition
    }

    /// Re-arm the fence after a successful persist.
    pub(crate) fn refresh_condition(&mut self) {
        self.condition = self.execution_info.next_event_id;
    }

    /// Whether the run is still open.
    pub fn is_running(&self) -> bool {
        self.execution_info.state != WorkflowState::Completed
    }

    /// Id the next appended event will take.
    pub fn next_event_id(&self) -> i64 {
        self.execution_info.next_event_id
    }

    /// Version of the last persisted write.
    pub fn last_write_version(&self) -> i64 {
        self.replication_state.last_write_version
    }

    /// The replication bookkeeping vector.
    pub fn replication_state(&self) -> &ReplicationState {
        &self.replication_state
    }

    /// In-flight activity by scheduled event id.
    pub fn get_activity(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.activity_infos.get(&schedule_id)
    }

    /// Whether the run holds active-side buffered events.
    pub fn has_buffered_events(&self) -> bool {
        !self.buffered_events.is_empty()
    }

    /// Whether any out-of-order replication batches are parked.
    pub fn has_buffered_replication_tasks(&self) -> bool {
        !self.buffered_replication_tasks.is_empty()
    }

    /// All parked replication batches, keyed by first event id.
    pub fn buffered_replication_tasks(&self) -> &HashMap<i64, BufferedReplicationTask> {
        &self.buffered_replication_tasks
    }

    /// Park an out-of-order replication batch.
    pub fn buffer_replication_task(&mut self, request: &ReplicateEventsRequest) {
        self.buffered_replication_tasks.insert(
            request.first_event_id,
            BufferedReplicationTask {
                first_event_id: request.first_event_id,
                next_event_id: request.next_event_id,
                version: request.version,
                events: request.history.clone(),
                new_run_events: request.new_run_history.clone(),
                event_store_version: request.event_store_version,
                new_run_event_store_version: request.new_run_event_store_version,
            },
        );
    }

    /// Remove a parked batch.
    pub fn delete_buffered_replication_task(
        &mut self,
        first_event_id: i64,
    ) -> Option<BufferedReplicationTask> {
        self.buffered_replication_tasks.remove(&first_event_id)
    }

    /// Record the last applied event from `cluster`.
    ///
    /// Updates the last-write watermark and, for remote clusters, the
    /// per-peer replication-info entry.
    pub fn update_replication_state_last_event(
        &mut self,
        cluster: &str,
        version: i64,
        last_event_id: i64,
    ) {
        self.replication_state.last_write_version = version;
        self.replication_state.last_write_event_id = last_event_id;
        if cluster != self.current_cluster {
            self.replication_state.last_replication_info.insert(
                cluster.to_string(),
                meridian_protocol::ReplicationInfo {
                    version,
                    last_event_id,
                },
            );
        }
    }

    /// Raise the current version. With `allow_equal`, re-asserts an equal
    /// version (used before locally authoring events at the standing
    /// version).
    pub fn update_replication_state_version(&mut self, version: i64, allow_equal: bool) {
        let current = self.replication_state.current_version;
        if version > current || (allow_equal && version == current) {
            self.replication_state.current_version = version;
        }
    }

    /// In-flight decision, if one has started.
    pub fn get_in_flight_decision(&self) -> Option<&DecisionInfo> {
        self.pending_decision
            .as_ref()
            .filter(|di| di.started_id != EMPTY_EVENT_ID)
    }

    /// Apply an activity sync. The caller decides `reset_timer_bits` from
    /// cluster and attempt comparison.
    pub fn replicate_activity_info(
        &mut self,
        request: &SyncActivityRequest,
        reset_timer_bits: bool,
    ) -> Result<(), ReplicationError> {
        let ai = self.activity_infos.get_mut(&request.scheduled_id).ok_or(
            ReplicationError::InternalFailure {
                details: format!(
                    "sync activity for unknown schedule id {}",
                    request.scheduled_id
                ),
            },
        )?;
        ai.version = request.version;
        if let Some(scheduled_time) = request.scheduled_time {
            ai.scheduled_time = scheduled_time;
        }
        ai.started_id = request.started_id;
        ai.started_time = request.started_time;
        ai.last_heartbeat_time = request.last_heartbeat_time;
        ai.details = request.details.clone();
        ai.attempt = request.attempt;
        if reset_timer_bits {
            ai.timer_task_status = timer_task_status::NONE;
        }
        Ok(())
    }

    /// Author a decision-task-failed event at the current version and flush
    /// active-side buffered events behind it.
    pub fn add_decision_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        cause: DecisionTaskFailedCause,
        identity: &str,
    ) {
        let version = self.replication_state.current_version;
        let event_id = self.execution_info.next_event_id;
        self.pending_events.push(HistoryEvent {
            event_id,
            version,
            timestamp: Utc::now(),
            attributes: EventAttributes::DecisionTaskFailed {
                scheduled_event_id: schedule_id,
                started_event_id: started_id,
                cause,
                identity: identity.to_string(),
            },
        });
        self.execution_info.next_event_id += 1;
        self.pending_decision = None;

        // Buffered events delayed id generation; closing the decision
        // assigns their ids now.
        let buffered = std::mem::take(&mut self.buffered_events);
        for mut event in buffered {
            event.event_id = self.execution_info.next_event_id;
            event.version = version;
            self.pending_events.push(event);
            self.execution_info.next_event_id += 1;
        }
    }

    /// Author a signal event at the current version.
    pub fn add_workflow_execution_signaled_event(
        &mut self,
        signal_name: &str,
        input: Option<Vec<u8>>,
        identity: &str,
    ) {
        let event_id = self.execution_info.next_event_id;
        self.pending_events.push(HistoryEvent {
            event_id,
            version: self.replication_state.current_version,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionSignaled {
                signal_name: signal_name.to_string(),
                input,
                identity: identity.to_string(),
            },
        });
        self.execution_info.next_event_id += 1;
    }

    /// Whether locally authored events await persistence.
    pub fn has_pending_events(&self) -> bool {
        !self.pending_events.is_empty()
    }

    /// Drain locally authored events for persistence.
    pub(crate) fn take_pending_events(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.pending_events)
    }

    // ========================================================================
    // Replication appliers, driven by the state builder
    // ========================================================================

    /// Apply a workflow-execution-started event.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn replicate_workflow_execution_started(
        &mut self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        request_id: &str,
        event_store_version: EventStoreVersion,
        event: &HistoryEvent,
    ) {
        let info = &mut self.execution_info;
        info.domain_id = domain_id.to_string();
        info.workflow_id = workflow_id.to_string();
        info.run_id = run_id.to_string();
        info.create_request_id = request_id.to_string();
        info.state = WorkflowState::Running;
        info.close_status = CloseStatus::None;
        info.start_time = event.timestamp;
        info.event_store_version = event_store_version;
        if event_store_version == EventStoreVersion::V2 && info.branch_token.is_none() {
            info.branch_token = Some(new_branch_token());
        }
        if let EventAttributes::WorkflowExecutionStarted {
            workflow_type,
            task_list,
            execution_start_to_close_timeout_seconds,
            task_start_to_close_timeout_seconds,
            parent,
            ..
        } = &event.attributes
        {
            info.workflow_type_name = workflow_type.clone();
            info.task_list = task_list.clone();
            info.workflow_timeout_seconds = *execution_start_to_close_timeout_seconds;
            info.decision_timeout_seconds = *task_start_to_close_timeout_seconds;
            if let Some(parent) = parent {
                info.parent_domain_id = Some(parent.domain_id.clone());
                info.parent_workflow_id = Some(parent.workflow_id.clone());
                info.parent_run_id = Some(parent.run_id.clone());
                info.initiated_id = parent.initiated_id;
            }
        }
    }

    /// Apply a decision-task-scheduled event.
    pub(crate) fn replicate_decision_task_scheduled(&mut self, event: &HistoryEvent) {
        if let EventAttributes::DecisionTaskScheduled {
            start_to_close_timeout_seconds,
            attempt,
            ..
        } = &event.attributes
        {
            self.pending_decision = Some(DecisionInfo {
                version: event.version,
                schedule_id: event.event_id,
                started_id: EMPTY_EVENT_ID,
                request_id: String::new(),
                decision_timeout_seconds: *start_to_close_timeout_seconds,
                attempt: *attempt,
            });
        }
    }

    /// Apply a decision-task-started event.
    pub(crate) fn replicate_decision_task_started(&mut self, event: &HistoryEvent) {
        if let EventAttributes::DecisionTaskStarted {
            scheduled_event_id,
            request_id,
            ..
        } = &event.attributes
        {
            if let Some(di) = self.pending_decision.as_mut() {
                if di.schedule_id == *scheduled_event_id {
                    di.version = event.version;
                    di.started_id = event.event_id;
                    di.request_id = request_id.clone();
                }
            }
        }
    }

    /// Apply any decision-closing event.
    pub(crate) fn replicate_decision_task_closed(&mut self) {
        self.pending_decision = None;
    }

    /// Apply an activity-task-scheduled event.
    pub(crate) fn replicate_activity_task_scheduled(&mut self, event: &HistoryEvent) {
        if let EventAttributes::ActivityTaskScheduled {
            activity_id,
            schedule_to_start_timeout_seconds,
            schedule_to_close_timeout_seconds,
            start_to_close_timeout_seconds,
            heartbeat_timeout_seconds,
            ..
        } = &event.attributes
        {
            self.activity_infos.insert(
                event.event_id,
                ActivityInfo {
                    version: event.version,
                    schedule_id: event.event_id,
                    scheduled_time: event.timestamp,
                    started_id: EMPTY_EVENT_ID,
                    started_time: None,
                    activity_id: activity_id.clone(),
                    details: None,
                    last_heartbeat_time: None,
                    attempt: 0,
                    timer_task_status: timer_task_status::NONE,
                    schedule_to_start_timeout_seconds: *schedule_to_start_timeout_seconds,
                    schedule_to_close_timeout_seconds: *schedule_to_close_timeout_seconds,
                    start_to_close_timeout_seconds: *start_to_close_timeout_seconds,
                    heartbeat_timeout_seconds: *heartbeat_timeout_seconds,
                },
            );
        }
    }

    /// Apply an activity-task-started event.
    pub(crate) fn replicate_activity_task_started(&mut self, event: &HistoryEvent) {
        if let EventAttributes::ActivityTaskStarted {
            scheduled_event_id,
            attempt,
            ..
        } = &event.attributes
        {
            if let Some(ai) = self.activity_infos.get_mut(scheduled_event_id) {
                ai.version = event.version;
                ai.started_id = event.event_id;
                ai.started_time = Some(event.timestamp);
                ai.attempt = *attempt;
            }
        }
    }

    /// Apply any activity-closing event.
    pub(crate) fn replicate_activity_task_closed(&mut self, schedule_id: i64) {
        self.activity_infos.remove(&schedule_id);
    }

    /// Apply a run-closing event.
    pub(crate) fn replicate_workflow_execution_closed(&mut self, close_status: CloseStatus) {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = close_status;
        self.pending_decision = None;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use meridian_protocol::WorkflowExecution;

    use super::*;

    fn started_event(version: i64) -> HistoryEvent {
        HistoryEvent {
            event_id: FIRST_EVENT_ID,
            version,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionStarted {
                workflow_type: "order-processing".to_string(),
                task_list: "orders".to_string(),
                input: None,
                execution_start_to_close_timeout_seconds: 300,
                task_start_to_close_timeout_seconds: 10,
                continued_execution_run_id: None,
                parent: None,
            },
        }
    }

    fn fresh_state(version: i64) -> MutableState {
        let mut ms = MutableState::new_for_replication("dc-east", version);
        let event = started_event(version);
        ms.replicate_workflow_execution_started(
            "d1",
            "wf-1",
            "run-1",
            "req-1",
            EventStoreVersion::V2,
            &event,
        );
        ms.execution_info.next_event_id = 2;
        ms
    }

    fn buffer_request(first_event_id: i64, version: i64) -> ReplicateEventsRequest {
        ReplicateEventsRequest {
            source_cluster: "dc-west".to_string(),
            domain_id: "d1".to_string(),
            execution: WorkflowExecution {
                workflow_id: "wf-1".to_string(),
                run_id: "run-1".to_string(),
            },
            first_event_id,
            next_event_id: first_event_id + 1,
            version,
            replication_info: HashMap::new(),
            history: vec![started_event(version)],
            new_run_history: Vec::new(),
            event_store_version: EventStoreVersion::V2,
            new_run_event_store_version: EventStoreVersion::V2,
            force_buffer_events: true,
            reset_workflow: false,
        }
    }

    #[test]
    fn test_started_applier_populates_execution_info() {
        let ms = fresh_state(10);
        assert!(ms.is_running());
        assert_eq!(ms.execution_info.workflow_type_name, "order-processing");
        assert_eq!(ms.execution_info.task_list, "orders");
        assert!(ms.execution_info.branch_token.is_some());
    }

    #[test]
    fn test_replication_state_last_event_tracks_remote_peers() {
        let mut ms = fresh_state(10);
        ms.update_replication_state_last_event("dc-west", 11, 5);
        assert_eq!(ms.last_write_version(), 11);
        assert_eq!(ms.replication_state.last_write_event_id, 5);
        assert_eq!(
            ms.replication_state.last_replication_info["dc-west"].last_event_id,
            5
        );

        // Events from the local cluster do not produce a peer entry.
        ms.update_replication_state_last_event("dc-east", 20, 9);
        assert!(!ms
            .replication_state
            .last_replication_info
            .contains_key("dc-east"));
    }

    #[test]
    fn test_update_version_requires_greater_unless_equal_allowed() {
        let mut ms = fresh_state(10);
        ms.update_replication_state_version(5, false);
        assert_eq!(ms.replication_state.current_version, 10);
        ms.update_replication_state_version(10, true);
        assert_eq!(ms.replication_state.current_version, 10);
        ms.update_replication_state_version(20, false);
        assert_eq!(ms.replication_state.current_version, 20);
    }

    #[test]
    fn test_buffered_task_round_trip() {
        let mut ms = fresh_state(10);
        ms.buffer_replication_task(&buffer_request(5, 10));
        assert!(ms.has_buffered_replication_tasks());
        assert_eq!(ms.buffered_replication_tasks()[&5].version, 10);

        let removed = ms.delete_buffered_replication_task(5);
        assert_eq!(removed.map(|bt| bt.first_event_id), Some(5));
        assert!(!ms.has_buffered_replication_tasks());
    }

    #[test]
    fn test_decision_task_failed_flushes_buffered_events() {
        let mut ms = fresh_state(10);
        ms.pending_decision = Some(DecisionInfo {
            version: 10,
            schedule_id: 2,
            started_id: 3,
            request_id: "r".to_string(),
            decision_timeout_seconds: 10,
            attempt: 0,
        });
        ms.execution_info.next_event_id = 4;
        ms.buffered_events.push(HistoryEvent {
            event_id: EMPTY_EVENT_ID,
            version: 10,
            timestamp: Utc::now(),
            attributes: EventAttributes::WorkflowExecutionSignaled {
                signal_name: "s".to_string(),
                input: None,
                identity: "i".to_string(),
            },
        });

        ms.add_decision_task_failed_event(
            2,
            3,
            DecisionTaskFailedCause::FailoverCloseDecision,
            "history-service",
        );

        assert!(ms.pending_decision.is_none());
        assert!(!ms.has_buffered_events());
        let events = ms.take_pending_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, 4);
        assert_eq!(events[1].event_id, 5);
        assert_eq!(ms.next_event_id(), 6);
    }
}
