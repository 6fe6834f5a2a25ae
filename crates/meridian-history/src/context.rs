// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exclusive per-run execution context.
//!
//! An [`ExecutionContext`] owns access to one workflow run's mutable state
//! while its cache lock is held. All persistence flows through the context:
//! history appends branch on the event-store layout exactly once here, and
//! every snapshot write is fenced on the `next_event_id` captured at load
//! time.

use std::sync::Arc;

use tracing::debug;

use meridian_protocol::{HistoryEvent, WorkflowExecution};

use crate::mutable_state::MutableState;
use crate::persistence::{
    AppendHistoryEventsRequest, AppendHistoryNodesRequest, ExecutionStore, HistoryStore,
    StoreError, TimerTask, TransferTask, UpdateWorkflowExecutionRequest,
};
use crate::shard::ShardContext;
use meridian_protocol::EventStoreVersion;

/// Exclusive handle on one workflow run's state.
pub struct ExecutionContext {
    domain_id: String,
    execution: WorkflowExecution,
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    current_cluster: String,
    mutable_state: Option<MutableState>,
}

impl ExecutionContext {
    /// Create a context for one run. The mutable state is loaded lazily.
    pub fn new(
        domain_id: impl Into<String>,
        execution: WorkflowExecution,
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        current_cluster: impl Into<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            execution,
            shard,
            execution_store,
            history_store,
            current_cluster: current_cluster.into(),
            mutable_state: None,
        }
    }

    /// Domain owning the run.
    pub fn domain_id(&self) -> &str {
        &self.domain_id
    }

    /// The run this context guards.
    pub fn execution(&self) -> &WorkflowExecution {
        &self.execution
    }

    /// Load the run's mutable state, reusing the cached copy when present.
    pub async fn load_workflow_execution(&mut self) -> Result<&mut MutableState, StoreError> {
        if self.mutable_state.is_none() {
            let snapshot = self
                .execution_store
                .get_workflow_execution(
                    &self.domain_id,
                    &self.execution.workflow_id,
                    &self.execution.run_id,
                )
                .await?;
            self.mutable_state = Some(MutableState::from_snapshot(
                &self.current_cluster,
                snapshot,
            ));
        }
        // The branch above guarantees presence.
        self.mutable_state
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("mutable state load raced".to_string()))
    }

    /// The cached mutable state, if loaded.
    pub fn mutable_state(&mut self) -> Option<&mut MutableState> {
        self.mutable_state.as_mut()
    }

    /// Replace the cached mutable state (after create or reset).
    pub fn set_mutable_state(&mut self, ms: MutableState) {
        self.mutable_state = Some(ms);
    }

    /// Remove and return the cached mutable state.
    pub fn take_mutable_state(&mut self) -> Option<MutableState> {
        self.mutable_state.take()
    }

    /// Drop the cached mutable state so the next holder re-reads storage.
    pub fn clear_cached_state(&mut self) {
        if self.mutable_state.is_some() {
            debug!(
                workflow_id = %self.execution.workflow_id,
                run_id = %self.execution.run_id,
                "invalidating cached mutable state"
            );
        }
        self.mutable_state = None;
    }

    /// Append a batch to the run's history log. This is the single place the
    /// event-store layout is branched on for writes.
    pub async fn append_batch(
        history_store: &Arc<dyn HistoryStore>,
        domain_id: &str,
        execution: &WorkflowExecution,
        ms: &mut MutableState,
        events: &[HistoryEvent],
        is_new_branch: bool,
        transaction_id: i64,
    ) -> Result<usize, StoreError> {
        let first = match events.first() {
            Some(event) => event,
            None => return Ok(0),
        };
        let size = match ms.execution_info.event_store_version {
            EventStoreVersion::V2 => {
                let branch_token = ms
                    .execution_info
                    .branch_token
                    .clone()
                    .ok_or(StoreError::BranchNotFound)?;
                history_store
                    .append_history_nodes(AppendHistoryNodesRequest {
                        branch_token,
                        is_new_branch,
                        transaction_id,
                        events: events.to_vec(),
                    })
                    .await?
            }
            EventStoreVersion::V1 => {
                history_store
                    .append_history_events(AppendHistoryEventsRequest {
                        domain_id: domain_id.to_string(),
                        execution: execution.clone(),
                        first_event_id: first.event_id,
                        event_batch_version: first.version,
                        transaction_id,
                        events: events.to_vec(),
                    })
                    .await?
            }
        };
        ms.execution_info.history_size += size as i64;
        Ok(size)
    }

    /// Persist a replicated batch: append it to history, advance the
    /// replication watermark, and conditionally replace the snapshot.
    pub async fn replicate_workflow_execution(
        &mut self,
        source_cluster: &str,
        events: &[HistoryEvent],
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
    ) -> Result<(), StoreError> {
        let history_store = Arc::clone(&self.history_store);
        let execution_store = Arc::clone(&self.execution_store);
        let domain_id = self.domain_id.clone();
        let execution = self.execution.clone();
        let ms = self
            .mutable_state
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("no mutable state to persist".to_string()))?;

        let last = match events.last() {
            Some(event) => event.clone(),
            None => return Ok(()),
        };
        let transaction_id = self.shard.next_transfer_task_id();
        Self::append_batch(
            &history_store,
            &domain_id,
            &execution,
            ms,
            events,
            false,
            transaction_id,
        )
        .await?;
        ms.update_replication_state_last_event(source_cluster, last.version, last.event_id);

        let condition = ms.condition();
        execution_store
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot: ms.to_snapshot(),
                condition_next_event_id: condition,
                transfer_tasks,
                timer_tasks,
            })
            .await?;
        ms.refresh_condition();
        Ok(())
    }

    /// Persist locally authored pending events (if any) and the snapshot.
    pub async fn update_workflow_execution(
        &mut self,
        transfer_tasks: Vec<TransferTask>,
        timer_tasks: Vec<TimerTask>,
    ) -> Result<(), StoreError> {
        let history_store = Arc::clone(&self.history_store);
        let execution_store = Arc::clone(&self.execution_store);
        let domain_id = self.domain_id.clone();
        let execution = self.execution.clone();
        let ms = self
            .mutable_state
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("no mutable state to persist".to_string()))?;

        let pending = ms.take_pending_events();
        if let Some(last) = pending.last() {
            let last_event_id = last.event_id;
            let transaction_id = self.shard.next_transfer_task_id();
            Self::append_batch(
                &history_store,
                &domain_id,
                &execution,
                ms,
                &pending,
                false,
                transaction_id,
            )
            .await?;
            ms.replication_state.last_write_version = ms.replication_state.current_version;
            ms.replication_state.last_write_event_id = last_event_id;
        }

        let condition = ms.condition();
        execution_store
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot: ms.to_snapshot(),
                condition_next_event_id: condition,
                transfer_tasks,
                timer_tasks,
            })
            .await?;
        ms.refresh_condition();
        Ok(())
    }

    /// Append the successor run's first history batch during continue-as-new
    /// replication.
    pub async fn append_first_batch_history_for_continue_as_new(
        &self,
        new_run_ms: &mut MutableState,
        events: &[HistoryEvent],
    ) -> Result<usize, StoreError> {
        let new_execution = WorkflowExecution {
            workflow_id: new_run_ms.execution_info.workflow_id.clone(),
            run_id: new_run_ms.execution_info.run_id.clone(),
        };
        let transaction_id = self.shard.next_transfer_task_id();
        Self::append_batch(
            &self.history_store,
            &self.domain_id,
            &new_execution,
            new_run_ms,
            events,
            true,
            transaction_id,
        )
        .await
    }
}
