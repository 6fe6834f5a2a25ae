// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applies replicated event batches to mutable state.
//!
//! The state builder walks an ordered batch, drives the matching mutable
//! state appliers, and collects the transfer and timer tasks the local
//! processors need. A batch ending in continue-as-new also bootstraps the
//! successor run's mutable state from the new-run history carried alongside.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use meridian_protocol::events::{EventAttributes, TimeoutType};
use meridian_protocol::{EventStoreVersion, HistoryEvent, WorkflowExecution};

use crate::error::ReplicationError;
use crate::mutable_state::MutableState;
use crate::persistence::{
    CloseStatus, DecisionInfo, TimerTask, TimerTaskKind, TransferTask, TransferTaskKind,
    EMPTY_EVENT_ID,
};

/// The successor run bootstrapped by a continue-as-new batch.
pub struct NewRunState {
    /// Mutable state of the successor run after its first batch.
    pub mutable_state: MutableState,
    /// The successor run's first event batch.
    pub events: Vec<HistoryEvent>,
    /// Storage layout of the successor run's history.
    pub event_store_version: EventStoreVersion,
}

/// Result of applying one batch.
pub struct AppliedBatch {
    /// Last event of the batch.
    pub last_event: HistoryEvent,
    /// In-flight decision after the batch, if any.
    pub decision: Option<DecisionInfo>,
    /// Successor run, when the batch ends in continue-as-new.
    pub new_run: Option<NewRunState>,
    /// Transfer tasks produced by the batch.
    pub transfer_tasks: Vec<TransferTask>,
    /// Timer tasks produced by the batch.
    pub timer_tasks: Vec<TimerTask>,
}

/// Applies ordered event batches to mutable state.
///
/// Pluggable for testing; the default implementation is
/// [`DefaultStateBuilder`].
pub trait StateBuilding: Send + Sync {
    /// Apply `events` (and the successor run's `new_run_events`, when
    /// present) to `ms`.
    #[allow(clippy::too_many_arguments)]
    fn apply_events(
        &self,
        ms: &mut MutableState,
        domain_id: &str,
        request_id: &str,
        execution: &WorkflowExecution,
        events: &[HistoryEvent],
        new_run_events: &[HistoryEvent],
        event_store_version: EventStoreVersion,
        new_run_event_store_version: EventStoreVersion,
    ) -> Result<AppliedBatch, ReplicationError>;
}

/// Default state builder.
pub struct DefaultStateBuilder {
    current_cluster: String,
}

impl DefaultStateBuilder {
    /// Create a builder for the given local cluster.
    pub fn new(current_cluster: impl Into<String>) -> Self {
        Self {
            current_cluster: current_cluster.into(),
        }
    }

    fn apply_one(
        &self,
        ms: &mut MutableState,
        domain_id: &str,
        request_id: &str,
        execution: &WorkflowExecution,
        event_store_version: EventStoreVersion,
        event: &HistoryEvent,
        transfer_tasks: &mut Vec<TransferTask>,
        timer_tasks: &mut Vec<TimerTask>,
    ) {
        ms.update_replication_state_version(event.version, false);
        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                execution_start_to_close_timeout_seconds,
                ..
            } => {
                ms.replicate_workflow_execution_started(
                    domain_id,
                    &execution.workflow_id,
                    &execution.run_id,
                    request_id,
                    event_store_version,
                    event,
                );
                timer_tasks.push(TimerTask {
                    version: event.version,
                    visibility_time: event.timestamp
                        + Duration::seconds(*execution_start_to_close_timeout_seconds as i64),
                    kind: TimerTaskKind::WorkflowTimeout,
                });
            }
            EventAttributes::DecisionTaskScheduled { task_list, .. } => {
                ms.replicate_decision_task_scheduled(event);
                transfer_tasks.push(TransferTask {
                    version: event.version,
                    visibility_time: event.timestamp,
                    kind: TransferTaskKind::DecisionTask {
                        schedule_id: event.event_id,
                        task_list: task_list.clone(),
                    },
                });
            }
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id, ..
            } => {
                ms.replicate_decision_task_started(event);
                let timeout = ms.execution_info.decision_timeout_seconds;
                timer_tasks.push(TimerTask {
                    version: event.version,
                    visibility_time: event.timestamp + Duration::seconds(timeout as i64),
                    kind: TimerTaskKind::DecisionTimeout {
                        schedule_id: *scheduled_event_id,
                    },
                });
            }
            EventAttributes::DecisionTaskCompleted { .. }
            | EventAttributes::DecisionTaskFailed { .. }
            | EventAttributes::DecisionTaskTimedOut { .. } => {
                ms.replicate_decision_task_closed();
            }
            EventAttributes::ActivityTaskScheduled {
                task_list,
                schedule_to_close_timeout_seconds,
                ..
            } => {
                ms.replicate_activity_task_scheduled(event);
                transfer_tasks.push(TransferTask {
                    version: event.version,
                    visibility_time: event.timestamp,
                    kind: TransferTaskKind::ActivityTask {
                        schedule_id: event.event_id,
                        task_list: task_list.clone(),
                    },
                });
                if *schedule_to_close_timeout_seconds > 0 {
                    timer_tasks.push(TimerTask {
                        version: event.version,
                        visibility_time: event.timestamp
                            + Duration::seconds(*schedule_to_close_timeout_seconds as i64),
                        kind: TimerTaskKind::ActivityTimeout {
                            schedule_id: event.event_id,
                            timeout_type: TimeoutType::ScheduleToClose,
                        },
                    });
                }
            }
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id, ..
            } => {
                ms.replicate_activity_task_started(event);
                if let Some(ai) = ms.get_activity(*scheduled_event_id) {
                    if ai.start_to_close_timeout_seconds > 0 {
                        timer_tasks.push(TimerTask {
                            version: event.version,
                            visibility_time: event.timestamp
                                + Duration::seconds(ai.start_to_close_timeout_seconds as i64),
                            kind: TimerTaskKind::ActivityTimeout {
                                schedule_id: *scheduled_event_id,
                                timeout_type: TimeoutType::StartToClose,
                            },
                        });
                    }
                }
            }
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskTimedOut {
                scheduled_event_id, ..
            } => {
                ms.replicate_activity_task_closed(*scheduled_event_id);
            }
            EventAttributes::TimerStarted {
                start_to_fire_timeout_seconds,
                ..
            } => {
                timer_tasks.push(TimerTask {
                    version: event.version,
                    visibility_time: event.timestamp
                        + Duration::seconds(*start_to_fire_timeout_seconds),
                    kind: TimerTaskKind::UserTimer {
                        started_event_id: event.event_id,
                    },
                });
            }
            EventAttributes::TimerFired { .. } | EventAttributes::WorkflowExecutionSignaled { .. } => {}
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                ms.replicate_workflow_execution_closed(CloseStatus::Completed);
                transfer_tasks.push(close_task(event));
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                ms.replicate_workflow_execution_closed(CloseStatus::Failed);
                transfer_tasks.push(close_task(event));
            }
            EventAttributes::WorkflowExecutionTimedOut { .. } => {
                ms.replicate_workflow_execution_closed(CloseStatus::TimedOut);
                transfer_tasks.push(close_task(event));
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                ms.replicate_workflow_execution_closed(CloseStatus::Terminated);
                transfer_tasks.push(close_task(event));
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                ms.replicate_workflow_execution_closed(CloseStatus::ContinuedAsNew);
                transfer_tasks.push(close_task(event));
            }
        }
        ms.execution_info.next_event_id = event.event_id + 1;
    }
}

fn close_task(event: &HistoryEvent) -> TransferTask {
    TransferTask {
        version: event.version,
        visibility_time: event.timestamp,
        kind: TransferTaskKind::CloseExecution,
    }
}

impl StateBuilding for DefaultStateBuilder {
    fn apply_events(
        &self,
        ms: &mut MutableState,
        domain_id: &str,
        request_id: &str,
        execution: &WorkflowExecution,
        events: &[HistoryEvent],
        new_run_events: &[HistoryEvent],
        event_store_version: EventStoreVersion,
        new_run_event_store_version: EventStoreVersion,
    ) -> Result<AppliedBatch, ReplicationError> {
        let first_event = events
            .first()
            .ok_or_else(|| ReplicationError::InternalFailure {
                details: "state builder invoked with empty batch".to_string(),
            })?;
        let last_event = events[events.len() - 1].clone();

        ms.execution_info.last_first_event_id = first_event.event_id;
        let mut transfer_tasks = Vec::new();
        let mut timer_tasks = Vec::new();
        for event in events {
            self.apply_one(
                ms,
                domain_id,
                request_id,
                execution,
                event_store_version,
                event,
                &mut transfer_tasks,
                &mut timer_tasks,
            );
        }

        // A batch ending in continue-as-new carries the successor run's first
        // batch; bootstrap its mutable state here so the caller can persist
        // both runs.
        let mut new_run = None;
        if let EventAttributes::WorkflowExecutionContinuedAsNew {
            new_execution_run_id,
            ..
        } = &last_event.attributes
        {
            let new_run_first =
                new_run_events
                    .first()
                    .ok_or_else(|| ReplicationError::InternalFailure {
                        details: "continue-as-new batch without new run history".to_string(),
                    })?;
            let mut new_ms =
                MutableState::new_for_replication(&self.current_cluster, new_run_first.version);
            let new_execution = WorkflowExecution {
                workflow_id: execution.workflow_id.clone(),
                run_id: new_execution_run_id.clone(),
            };
            let new_request_id = Uuid::new_v4().to_string();
            let mut new_transfer = Vec::new();
            let mut new_timer = Vec::new();
            for event in new_run_events {
                self.apply_one(
                    &mut new_ms,
                    domain_id,
                    &new_request_id,
                    &new_execution,
                    new_run_event_store_version,
                    event,
                    &mut new_transfer,
                    &mut new_timer,
                );
            }
            // The successor's tasks ride with the parent batch notification.
            transfer_tasks.extend(new_transfer);
            timer_tasks.extend(new_timer);
            new_run = Some(NewRunState {
                mutable_state: new_ms,
                events: new_run_events.to_vec(),
                event_store_version: new_run_event_store_version,
            });
        }

        Ok(AppliedBatch {
            decision: ms.pending_decision.clone(),
            last_event,
            new_run,
            transfer_tasks,
            timer_tasks,
        })
    }
}

/// Derive the next activity timeout timer, if any activity needs one.
///
/// Used by activity sync to refresh the timer after heartbeats move the
/// deadline. The earliest deadline across all in-flight activities wins.
pub fn activity_timer_if_needed(ms: &MutableState, now: DateTime<Utc>) -> Option<TimerTask> {
    let mut best: Option<TimerTask> = None;
    for ai in ms.activity_infos.values() {
        let candidate = if ai.started_id != EMPTY_EVENT_ID {
            let base = [Some(ai.scheduled_time), ai.started_time, ai.last_heartbeat_time]
                .into_iter()
                .flatten()
                .max()
                .unwrap_or(now);
            if ai.heartbeat_timeout_seconds > 0 {
                Some(TimerTask {
                    version: ai.version,
                    visibility_time: base + Duration::seconds(ai.heartbeat_timeout_seconds as i64),
                    kind: TimerTaskKind::ActivityTimeout {
                        schedule_id: ai.schedule_id,
                        timeout_type: TimeoutType::Heartbeat,
                    },
                })
            } else if ai.start_to_close_timeout_seconds > 0 {
                Some(TimerTask {
                    version: ai.version,
                    visibility_time: base
                        + Duration::seconds(ai.start_to_close_timeout_seconds as i64),
                    kind: TimerTaskKind::ActivityTimeout {
                        schedule_id: ai.schedule_id,
                        timeout_type: TimeoutType::StartToClose,
                    },
                })
            } else {
                None
            }
        } else if ai.schedule_to_start_timeout_seconds > 0 {
            Some(TimerTask {
                version: ai.version,
                visibility_time: ai.scheduled_time
                    + Duration::seconds(ai.schedule_to_start_timeout_seconds as i64),
                kind: TimerTaskKind::ActivityTimeout {
                    schedule_id: ai.schedule_id,
                    timeout_type: TimeoutType::ScheduleToStart,
                },
            })
        } else {
            None
        };
        match (&best, candidate) {
            (_, None) => {}
            (None, Some(task)) => best = Some(task),
            (Some(current), Some(task)) if task.visibility_time < current.visibility_time => {
                best = Some(task)
            }
            _ => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn event(event_id: i64, version: i64, attributes: EventAttributes) -> HistoryEvent {
        HistoryEvent {
            event_id,
            version,
            timestamp: Utc::now(),
            attributes,
        }
    }

    fn started(event_id: i64, version: i64) -> HistoryEvent {
        event(
            event_id,
            version,
            EventAttributes::WorkflowExecutionStarted {
                workflow_type: "t".to_string(),
                task_list: "tl".to_string(),
                input: None,
                execution_start_to_close_timeout_seconds: 60,
                task_start_to_close_timeout_seconds: 10,
                continued_execution_run_id: None,
                parent: None,
            },
        )
    }

    fn apply(
        ms: &mut MutableState,
        execution: &WorkflowExecution,
        events: Vec<HistoryEvent>,
    ) -> AppliedBatch {
        DefaultStateBuilder::new("dc-east")
            .apply_events(
                ms,
                "d1",
                "req-1",
                execution,
                &events,
                &[],
                EventStoreVersion::V2,
                EventStoreVersion::V2,
            )
            .unwrap()
    }

    #[test]
    fn test_start_batch_produces_workflow_timeout_timer() {
        let execution = WorkflowExecution {
            workflow_id: "wf-1".to_string(),
            run_id: "run-1".to_string(),
        };
        let mut ms = MutableState::new_for_replication("dc-east", 10);
        let batch = apply(&mut ms, &execution, vec![started(1, 10)]);

        assert!(ms.is_running());
        assert_eq!(ms.next_event_id(), 2);
        assert!(batch
            .timer_tasks
            .iter()
            .any(|t| matches!(t.kind, TimerTaskKind::WorkflowTimeout)));
    }

    #[test]
    fn test_decision_and_activity_lifecycle() {
        let execution = WorkflowExecution {
            workflow_id: "wf-1".to_string(),
            run_id: "run-1".to_string(),
        };
        let mut ms = MutableState::new_for_replication("dc-east", 10);
        apply(&mut ms, &execution, vec![started(1, 10)]);

        let batch = apply(
            &mut ms,
            &execution,
            vec![
                event(
                    2,
                    10,
                    EventAttributes::DecisionTaskScheduled {
                        task_list: "tl".to_string(),
                        start_to_close_timeout_seconds: 10,
                        attempt: 0,
                    },
                ),
                event(
                    3,
                    10,
                    EventAttributes::DecisionTaskStarted {
                        scheduled_event_id: 2,
                        identity: "w".to_string(),
                        request_id: "r".to_string(),
                    },
                ),
                event(
                    4,
                    10,
                    EventAttributes::DecisionTaskCompleted {
                        scheduled_event_id: 2,
                        started_event_id: 3,
                        identity: "w".to_string(),
                    },
                ),
                event(
                    5,
                    10,
                    EventAttributes::ActivityTaskScheduled {
                        activity_id: "a1".to_string(),
                        activity_type: "charge".to_string(),
                        task_list: "tl".to_string(),
                        input: None,
                        schedule_to_start_timeout_seconds: 10,
                        schedule_to_close_timeout_seconds: 60,
                        start_to_close_timeout_seconds: 30,
                        heartbeat_timeout_seconds: 5,
                        decision_task_completed_event_id: 4,
                    },
                ),
            ],
        );

        assert_eq!(ms.next_event_id(), 6);
        assert!(ms.pending_decision.is_none());
        assert!(ms.get_activity(5).is_some());
        assert!(batch
            .transfer_tasks
            .iter()
            .any(|t| matches!(t.kind, TransferTaskKind::ActivityTask { schedule_id: 5, .. })));

        // Activity close removes the info.
        apply(
            &mut ms,
            &execution,
            vec![
                event(
                    6,
                    10,
                    EventAttributes::ActivityTaskStarted {
                        scheduled_event_id: 5,
                        identity: "w".to_string(),
                        attempt: 0,
                    },
                ),
                event(
                    7,
                    10,
                    EventAttributes::ActivityTaskCompleted {
                        scheduled_event_id: 5,
                        started_event_id: 6,
                        result: None,
                    },
                ),
            ],
        );
        assert!(ms.get_activity(5).is_none());
    }

    #[test]
    fn test_continue_as_new_bootstraps_successor_run() {
        let execution = WorkflowExecution {
            workflow_id: "wf-1".to_string(),
            run_id: "run-1".to_string(),
        };
        let mut ms = MutableState::new_for_replication("dc-east", 10);
        apply(&mut ms, &execution, vec![started(1, 10)]);

        let continued = event(
            2,
            10,
            EventAttributes::WorkflowExecutionContinuedAsNew {
                new_execution_run_id: "run-2".to_string(),
                workflow_type: "t".to_string(),
                task_list: "tl".to_string(),
                decision_task_completed_event_id: 1,
            },
        );
        let batch = DefaultStateBuilder::new("dc-east")
            .apply_events(
                &mut ms,
                "d1",
                "req-1",
                &execution,
                &[continued],
                &[started(1, 10)],
                EventStoreVersion::V2,
                EventStoreVersion::V2,
            )
            .unwrap();

        assert!(!ms.is_running());
        assert_eq!(ms.execution_info.close_status, CloseStatus::ContinuedAsNew);
        let new_run = batch.new_run.expect("successor run");
        assert_eq!(new_run.mutable_state.execution_info.run_id, "run-2");
        assert!(new_run.mutable_state.is_running());
    }
}
