// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence backend.
//!
//! Implements the full conditional-write contract of [`ExecutionStore`] and
//! [`HistoryStore`] against process-local maps. Backs the test suite and
//! embedded single-process deployments; durable backends live with the host
//! service.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use meridian_protocol::{HistoryEvent, WorkflowExecution};

use super::{
    new_branch_token, AppendHistoryEventsRequest, AppendHistoryNodesRequest,
    CreateWorkflowExecutionRequest, CreateWorkflowMode, CurrentExecution, ExecutionStore,
    HistoryStore, StoreError, TimerTask, TransferTask, UpdateWorkflowExecutionRequest,
    WorkflowSnapshot, WorkflowState,
};

type RunKey = (String, String, String);
type WorkflowKey = (String, String);

#[derive(Default)]
struct ExecutionsInner {
    executions: HashMap<RunKey, WorkflowSnapshot>,
    current: HashMap<WorkflowKey, String>,
    transfer_tasks: Vec<TransferTask>,
    timer_tasks: Vec<TimerTask>,
}

/// In-memory [`ExecutionStore`].
#[derive(Default)]
pub struct MemoryExecutionStore {
    inner: Mutex<ExecutionsInner>,
}

impl MemoryExecutionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ExecutionsInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// All transfer tasks recorded by create/update calls, in order.
    pub fn recorded_transfer_tasks(&self) -> Vec<TransferTask> {
        self.lock().transfer_tasks.clone()
    }

    /// All timer tasks recorded by create/update calls, in order.
    pub fn recorded_timer_tasks(&self) -> Vec<TimerTask> {
        self.lock().timer_tasks.clone()
    }

    fn already_started(snapshot: &WorkflowSnapshot) -> StoreError {
        StoreError::ExecutionAlreadyStarted {
            run_id: snapshot.execution_info.run_id.clone(),
            state: snapshot.execution_info.state,
            close_status: snapshot.execution_info.close_status,
            last_write_version: snapshot.replication_state.last_write_version,
        }
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn create_workflow_execution(
        &self,
        request: CreateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let info = &request.snapshot.execution_info;
        let run_key: RunKey = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        let workflow_key: WorkflowKey = (info.domain_id.clone(), info.workflow_id.clone());

        if let Some(existing) = inner.executions.get(&run_key) {
            return Err(Self::already_started(existing));
        }

        if let Some(current_run) = inner.current.get(&workflow_key).cloned() {
            let current_key: RunKey = (
                workflow_key.0.clone(),
                workflow_key.1.clone(),
                current_run.clone(),
            );
            let current = inner.executions.get(&current_key).ok_or_else(|| {
                StoreError::Unavailable(format!(
                    "current pointer names missing run {}",
                    current_run
                ))
            })?;
            match &request.mode {
                CreateWorkflowMode::BrandNew => {
                    return Err(Self::already_started(current));
                }
                CreateWorkflowMode::WorkflowIdReuse { prev_run_id, .. } => {
                    if *prev_run_id != current.execution_info.run_id
                        || current.execution_info.state != WorkflowState::Completed
                    {
                        return Err(Self::already_started(current));
                    }
                }
            }
        }

        inner.current.insert(workflow_key, info.run_id.clone());
        inner.executions.insert(run_key, request.snapshot);
        inner.transfer_tasks.extend(request.transfer_tasks);
        inner.timer_tasks.extend(request.timer_tasks);
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowSnapshot, StoreError> {
        let inner = self.lock();
        inner
            .executions
            .get(&(
                domain_id.to_string(),
                workflow_id.to_string(),
                run_id.to_string(),
            ))
            .cloned()
            .ok_or_else(|| StoreError::ExecutionNotFound {
                workflow_id: workflow_id.to_string(),
                run_id: Some(run_id.to_string()),
            })
    }

    async fn update_workflow_execution(
        &self,
        request: UpdateWorkflowExecutionRequest,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let info = &request.snapshot.execution_info;
        let run_key: RunKey = (
            info.domain_id.clone(),
            info.workflow_id.clone(),
            info.run_id.clone(),
        );
        let stored = inner.executions.get_mut(&run_key).ok_or_else(|| {
            StoreError::ExecutionNotFound {
                workflow_id: info.workflow_id.clone(),
                run_id: Some(info.run_id.clone()),
            }
        })?;
        let actual = stored.execution_info.next_event_id;
        if actual != request.condition_next_event_id {
            return Err(StoreError::ConditionFailed {
                expected: request.condition_next_event_id,
                actual,
            });
        }
        *stored = request.snapshot;
        inner.transfer_tasks.extend(request.transfer_tasks);
        inner.timer_tasks.extend(request.timer_tasks);
        Ok(())
    }

    async fn get_current_execution(
        &self,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<CurrentExecution, StoreError> {
        let inner = self.lock();
        let workflow_key = (domain_id.to_string(), workflow_id.to_string());
        let run_id =
            inner
                .current
                .get(&workflow_key)
                .ok_or_else(|| StoreError::ExecutionNotFound {
                    workflow_id: workflow_id.to_string(),
                    run_id: None,
                })?;
        let snapshot = inner
            .executions
            .get(&(
                domain_id.to_string(),
                workflow_id.to_string(),
                run_id.clone(),
            ))
            .ok_or_else(|| {
                StoreError::Unavailable(format!("current pointer names missing run {}", run_id))
            })?;
        Ok(CurrentExecution {
            run_id: run_id.clone(),
            state: snapshot.execution_info.state,
            close_status: snapshot.execution_info.close_status,
            last_write_version: snapshot.replication_state.last_write_version,
        })
    }
}

/// Batches keyed by first event id; each batch remembers the version it was
/// appended at so higher-version rewrites supersede it.
type BatchLog = BTreeMap<i64, (i64, Vec<HistoryEvent>)>;

#[derive(Default)]
struct HistoryInner {
    v1: HashMap<RunKey, BatchLog>,
    v2: HashMap<Bytes, BatchLog>,
}

/// In-memory [`HistoryStore`].
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<HistoryInner>,
}

impl MemoryHistoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HistoryInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn batch_size(events: &[HistoryEvent]) -> Result<usize, StoreError> {
        serde_json::to_vec(events)
            .map(|encoded| encoded.len())
            .map_err(|e| StoreError::Unavailable(format!("failed to encode batch: {}", e)))
    }

    fn append(log: &mut BatchLog, first_event_id: i64, version: i64, events: Vec<HistoryEvent>) {
        match log.get(&first_event_id) {
            Some((stored_version, _)) if *stored_version > version => {}
            _ => {
                log.insert(first_event_id, (version, events));
            }
        }
    }

    fn collect(log: &BatchLog, first_event_id: i64, next_event_id: i64) -> Vec<HistoryEvent> {
        // Later batches at a higher version supersede earlier events with the
        // same id (v1 rewind lineage).
        let mut by_id: BTreeMap<i64, (i64, HistoryEvent)> = BTreeMap::new();
        for (version, events) in log.values() {
            for event in events {
                if event.event_id < first_event_id || event.event_id >= next_event_id {
                    continue;
                }
                match by_id.get(&event.event_id) {
                    Some((stored_version, _)) if *stored_version >= *version => {}
                    _ => {
                        by_id.insert(event.event_id, (*version, event.clone()));
                    }
                }
            }
        }
        by_id.into_values().map(|(_, event)| event).collect()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append_history_events(
        &self,
        request: AppendHistoryEventsRequest,
    ) -> Result<usize, StoreError> {
        let size = Self::batch_size(&request.events)?;
        let mut inner = self.lock();
        let log = inner
            .v1
            .entry((
                request.domain_id,
                request.execution.workflow_id,
                request.execution.run_id,
            ))
            .or_default();
        Self::append(
            log,
            request.first_event_id,
            request.event_batch_version,
            request.events,
        );
        Ok(size)
    }

    async fn append_history_nodes(
        &self,
        request: AppendHistoryNodesRequest,
    ) -> Result<usize, StoreError> {
        let size = Self::batch_size(&request.events)?;
        let first_event_id = match request.events.first() {
            Some(event) => event.event_id,
            None => return Ok(0),
        };
        let version = request.events[0].version;
        let mut inner = self.lock();
        let log = if request.is_new_branch {
            inner.v2.entry(request.branch_token).or_default()
        } else {
            inner
                .v2
                .get_mut(&request.branch_token)
                .ok_or(StoreError::BranchNotFound)?
        };
        Self::append(log, first_event_id, version, request.events);
        Ok(size)
    }

    async fn read_history_events(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let inner = self.lock();
        let key = (
            domain_id.to_string(),
            execution.workflow_id.clone(),
            execution.run_id.clone(),
        );
        Ok(inner
            .v1
            .get(&key)
            .map(|log| Self::collect(log, first_event_id, next_event_id))
            .unwrap_or_default())
    }

    async fn read_history_branch(
        &self,
        branch_token: &Bytes,
        first_event_id: i64,
        next_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, StoreError> {
        let inner = self.lock();
        let log = inner.v2.get(branch_token).ok_or(StoreError::BranchNotFound)?;
        Ok(Self::collect(log, first_event_id, next_event_id))
    }

    async fn fork_history_branch(
        &self,
        branch_token: &Bytes,
        fork_event_id: i64,
    ) -> Result<Bytes, StoreError> {
        let mut inner = self.lock();
        let log = inner.v2.get(branch_token).ok_or(StoreError::BranchNotFound)?;
        let mut forked: BatchLog = BTreeMap::new();
        for (first_event_id, (version, events)) in log {
            let kept: Vec<HistoryEvent> = events
                .iter()
                .filter(|event| event.event_id < fork_event_id)
                .cloned()
                .collect();
            if !kept.is_empty() {
                forked.insert(*first_event_id, (*version, kept));
            }
        }
        let new_token = new_branch_token();
        inner.v2.insert(new_token.clone(), forked);
        Ok(new_token)
    }

    async fn delete_workflow_execution_history(
        &self,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.v1.remove(&(
            domain_id.to_string(),
            execution.workflow_id.clone(),
            execution.run_id.clone(),
        ));
        Ok(())
    }

    async fn delete_history_branch(&self, branch_token: &Bytes) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.v2.remove(branch_token);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use meridian_protocol::events::EventAttributes;

    use super::*;

    fn event(event_id: i64, version: i64) -> HistoryEvent {
        HistoryEvent {
            event_id,
            version,
            timestamp: Utc::now(),
            attributes: EventAttributes::DecisionTaskScheduled {
                task_list: "tl".to_string(),
                start_to_close_timeout_seconds: 10,
                attempt: 0,
            },
        }
    }

    #[tokio::test]
    async fn test_v2_append_read_fork() {
        let store = MemoryHistoryStore::new();
        let token = new_branch_token();
        store
            .append_history_nodes(AppendHistoryNodesRequest {
                branch_token: token.clone(),
                is_new_branch: true,
                transaction_id: 1,
                events: vec![event(1, 10), event(2, 10)],
            })
            .await
            .unwrap();
        store
            .append_history_nodes(AppendHistoryNodesRequest {
                branch_token: token.clone(),
                is_new_branch: false,
                transaction_id: 2,
                events: vec![event(3, 10), event(4, 10)],
            })
            .await
            .unwrap();

        let events = store.read_history_branch(&token, 1, 5).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );

        let forked = store.fork_history_branch(&token, 3).await.unwrap();
        let events = store.read_history_branch(&forked, 1, 10).await.unwrap();
        assert_eq!(
            events.iter().map(|e| e.event_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_v1_higher_version_batch_supersedes() {
        let store = MemoryHistoryStore::new();
        let execution = WorkflowExecution {
            workflow_id: "wf".to_string(),
            run_id: "run".to_string(),
        };
        let append = |events: Vec<HistoryEvent>, version: i64| AppendHistoryEventsRequest {
            domain_id: "d".to_string(),
            execution: execution.clone(),
            first_event_id: events[0].event_id,
            event_batch_version: version,
            transaction_id: 0,
            events,
        };
        store
            .append_history_events(append(vec![event(1, 10), event(2, 10)], 10))
            .await
            .unwrap();
        store
            .append_history_events(append(vec![event(3, 10)], 10))
            .await
            .unwrap();
        // Rewind lineage: event 3 rewritten at version 20.
        store
            .append_history_events(append(vec![event(3, 20)], 20))
            .await
            .unwrap();

        let events = store
            .read_history_events("d", &execution, 1, 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].version, 20);
    }
}
