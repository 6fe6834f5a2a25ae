// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mutable-state rewind to a common checkpoint.
//!
//! When version checking detects that local history diverged from the
//! incoming stream, the conflict resolver rebuilds mutable state by replaying
//! persisted history up to the checkpoint event and conditionally replaces
//! the stored snapshot. Everything after the checkpoint is abandoned: v2
//! switches the current branch token to a fork, v1 records a lineage marker
//! and lets higher-version appends supersede the stale tail.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};

use meridian_protocol::{EventStoreVersion, ReplicationInfo, WorkflowExecution};

use crate::error::{ReplicationError, Result};
use crate::mutable_state::MutableState;
use crate::persistence::{
    ExecutionStore, HistoryStore, ResetMarker, StoreError, UpdateWorkflowExecutionRequest,
    WorkflowExecutionInfo, FIRST_EVENT_ID,
};
use crate::state_builder::StateBuilding;

/// Rewinds one run's mutable state to an earlier event.
///
/// Pluggable for testing; the default implementation is
/// [`DefaultConflictResolver`].
#[async_trait]
pub trait ConflictResolution: Send + Sync {
    /// Rebuild mutable state by replaying history up to and including
    /// `replay_last_event_id`, then conditionally replace the stored
    /// snapshot fenced on `condition`.
    ///
    /// Losing the conditional-write race surfaces as
    /// [`StoreError::ConditionFailed`]; the caller must re-acquire and retry
    /// from scratch.
    async fn reset(
        &self,
        current_run_id: &str,
        request_id: &str,
        replay_last_event_id: i64,
        execution_info: &WorkflowExecutionInfo,
        prev_replication_info: HashMap<String, ReplicationInfo>,
        condition: i64,
    ) -> Result<MutableState>;
}

/// Default conflict resolver backed by the history and execution stores.
pub struct DefaultConflictResolver {
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    state_builder: Arc<dyn StateBuilding>,
    current_cluster: String,
}

impl DefaultConflictResolver {
    /// Create a resolver for the given stores and local cluster.
    pub fn new(
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        state_builder: Arc<dyn StateBuilding>,
        current_cluster: impl Into<String>,
    ) -> Self {
        Self {
            execution_store,
            history_store,
            state_builder,
            current_cluster: current_cluster.into(),
        }
    }
}

#[async_trait]
impl ConflictResolution for DefaultConflictResolver {
    #[instrument(skip_all, fields(
        workflow_id = %execution_info.workflow_id,
        run_id = %execution_info.run_id,
        replay_last_event_id,
    ))]
    async fn reset(
        &self,
        current_run_id: &str,
        request_id: &str,
        replay_last_event_id: i64,
        execution_info: &WorkflowExecutionInfo,
        prev_replication_info: HashMap<String, ReplicationInfo>,
        condition: i64,
    ) -> Result<MutableState> {
        let execution = WorkflowExecution {
            workflow_id: execution_info.workflow_id.clone(),
            run_id: execution_info.run_id.clone(),
        };

        let events = match execution_info.event_store_version {
            EventStoreVersion::V2 => {
                let branch_token = execution_info
                    .branch_token
                    .as_ref()
                    .ok_or(StoreError::BranchNotFound)?;
                self.history_store
                    .read_history_branch(branch_token, FIRST_EVENT_ID, replay_last_event_id + 1)
                    .await?
            }
            EventStoreVersion::V1 => {
                self.history_store
                    .read_history_events(
                        &execution_info.domain_id,
                        &execution,
                        FIRST_EVENT_ID,
                        replay_last_event_id + 1,
                    )
                    .await?
            }
        };
        let first = events
            .first()
            .ok_or_else(|| ReplicationError::InternalFailure {
                details: "no history events found".to_string(),
            })?;

        let mut ms = MutableState::new_for_replication(&self.current_cluster, first.version);
        // The started applier mints a fresh v2 branch token; the replayed run
        // must keep addressing its existing history until the fork below.
        let applied = self.state_builder.apply_events(
            &mut ms,
            &execution_info.domain_id,
            request_id,
            &execution,
            &events,
            &[],
            execution_info.event_store_version,
            execution_info.event_store_version,
        )?;

        ms.replication_state.last_write_version = applied.last_event.version;
        ms.replication_state.last_write_event_id = applied.last_event.event_id;
        ms.replication_state.last_replication_info = prev_replication_info;
        ms.execution_info.create_request_id = execution_info.create_request_id.clone();
        ms.execution_info.history_size = execution_info.history_size;

        match execution_info.event_store_version {
            EventStoreVersion::V2 => {
                let branch_token = execution_info
                    .branch_token
                    .as_ref()
                    .ok_or(StoreError::BranchNotFound)?;
                let forked = self
                    .history_store
                    .fork_history_branch(branch_token, replay_last_event_id + 1)
                    .await?;
                ms.execution_info.branch_token = Some(forked);
            }
            EventStoreVersion::V1 => {
                ms.execution_info.branch_token = None;
                ms.execution_info.reset_marker = Some(ResetMarker {
                    last_event_id: replay_last_event_id,
                    version: applied.last_event.version,
                });
            }
        }

        self.execution_store
            .update_workflow_execution(UpdateWorkflowExecutionRequest {
                snapshot: ms.to_snapshot(),
                condition_next_event_id: condition,
                transfer_tasks: Vec::new(),
                timer_tasks: Vec::new(),
            })
            .await?;
        ms.refresh_condition();

        info!(
            current_run_id,
            next_event_id = ms.next_event_id(),
            "completed resetting of workflow execution"
        );
        Ok(ms)
    }
}
