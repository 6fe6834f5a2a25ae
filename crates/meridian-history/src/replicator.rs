// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The history replicator.
//!
//! Ingests replication tasks from peer clusters and applies them to local
//! workflow state: enforcing per-run event order, buffering out-of-order
//! batches, detecting divergence across failovers from the replication-info
//! vector, rewinding to common checkpoints, and terminating losing runs.
//! Every decision is made while holding the run's exclusive cache lock.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use meridian_protocol::events::{DecisionTaskFailedCause, EventAttributes};
use meridian_protocol::{
    deserialize_batch, EventType, HistoryEvent, ReplicateEventsRequest, ReplicateRawEventsRequest,
    ReplicationInfo, SyncActivityRequest, WorkflowExecution,
};

use crate::cache::ExecutionCache;
use crate::cluster::{ClusterMetadata, EMPTY_VERSION};
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{ReplicationError, Result, RetryReason};
use crate::metrics::ReplicationMetrics;
use crate::mutable_state::MutableState;
use crate::persistence::{
    CreateWorkflowExecutionRequest, CreateWorkflowMode, ExecutionStore, HistoryStore, StoreError,
    WorkflowState, FIRST_EVENT_ID,
};
use crate::shard::{Notifier, ShardContext};
use crate::state_builder::{activity_timer_if_needed, AppliedBatch, StateBuilding};
use crate::conflict_resolver::ConflictResolution;

/// Reason stamped on terminations injected by conflict resolution.
pub const WORKFLOW_TERMINATION_REASON: &str = "Terminate Workflow Due To Version Conflict.";

/// Identity stamped on terminations injected by conflict resolution.
pub const WORKFLOW_TERMINATION_IDENTITY: &str = "worker-service";

/// Identity stamped on events the history service authors itself.
const HISTORY_SERVICE_IDENTITY: &str = "history-service";

/// Applies reset-workflow replication tasks once the current run is closed.
///
/// The host engine provides the real resetor; the default handler reports
/// retry-not-found so the task is redelivered to a host that has one.
#[async_trait]
pub trait ResetHandler: Send + Sync {
    /// Apply a reset-workflow replication task against the closed current
    /// run.
    async fn apply_reset_event(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
        current_run_id: &str,
    ) -> Result<()>;
}

/// Default [`ResetHandler`]: always asks for redelivery.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResetHandler;

#[async_trait]
impl ResetHandler for NoopResetHandler {
    async fn apply_reset_event(
        &self,
        _token: &CancellationToken,
        request: &ReplicateEventsRequest,
        _current_run_id: &str,
    ) -> Result<()> {
        Err(ReplicationError::retry_task(
            RetryReason::WorkflowNotFound,
            &request.domain_id,
            &request.execution.workflow_id,
            &request.execution.run_id,
            Some(FIRST_EVENT_ID),
        ))
    }
}

/// Probes the remote cluster's history during datacenter migration.
#[async_trait]
pub trait HistoryProber: Send + Sync {
    /// Event id of the last event local and remote history agree on.
    async fn last_match_event_id(
        &self,
        request: &ReplicateEventsRequest,
        ms: &MutableState,
    ) -> Result<i64>;
}

/// Cross-cluster history replicator for one shard.
pub struct HistoryReplicator {
    shard: Arc<ShardContext>,
    cache: Arc<ExecutionCache>,
    cluster_metadata: Arc<ClusterMetadata>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    config: Arc<Config>,
    metrics: Arc<ReplicationMetrics>,
    notifier: Arc<dyn Notifier>,
    state_builder: Arc<dyn StateBuilding>,
    conflict_resolver: Arc<dyn ConflictResolution>,
    reset_handler: Arc<dyn ResetHandler>,
    history_prober: Option<Arc<dyn HistoryProber>>,
}

impl HistoryReplicator {
    /// Create a replicator with default collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: Arc<ShardContext>,
        cache: Arc<ExecutionCache>,
        cluster_metadata: Arc<ClusterMetadata>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        config: Arc<Config>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let state_builder: Arc<dyn StateBuilding> = Arc::new(
            crate::state_builder::DefaultStateBuilder::new(cluster_metadata.current_cluster_name()),
        );
        let conflict_resolver: Arc<dyn ConflictResolution> =
            Arc::new(crate::conflict_resolver::DefaultConflictResolver::new(
                Arc::clone(&execution_store),
                Arc::clone(&history_store),
                Arc::clone(&state_builder),
                cluster_metadata.current_cluster_name(),
            ));
        Self {
            shard,
            cache,
            cluster_metadata,
            execution_store,
            history_store,
            config,
            metrics: Arc::new(ReplicationMetrics::new()),
            notifier,
            state_builder,
            conflict_resolver,
            reset_handler: Arc::new(NoopResetHandler),
            history_prober: None,
        }
    }

    /// Override the state builder (testing).
    pub fn with_state_builder(mut self, state_builder: Arc<dyn StateBuilding>) -> Self {
        self.state_builder = state_builder;
        self
    }

    /// Override the conflict resolver (testing).
    pub fn with_conflict_resolver(mut self, conflict_resolver: Arc<dyn ConflictResolution>) -> Self {
        self.conflict_resolver = conflict_resolver;
        self
    }

    /// Install the host's reset handler.
    pub fn with_reset_handler(mut self, reset_handler: Arc<dyn ResetHandler>) -> Self {
        self.reset_handler = reset_handler;
        self
    }

    /// Install a history prober for datacenter migration.
    pub fn with_history_prober(mut self, history_prober: Arc<dyn HistoryProber>) -> Self {
        self.history_prober = Some(history_prober);
        self
    }

    /// The replicator's counters.
    pub fn metrics(&self) -> &ReplicationMetrics {
        &self.metrics
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Apply a replication task whose batches are still encoded.
    #[instrument(skip(self, token, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
    ))]
    pub async fn apply_raw_events(
        &self,
        token: &CancellationToken,
        request: &ReplicateRawEventsRequest,
    ) -> Result<()> {
        let events = deserialize_batch(&request.history)?;
        let version = events[0].version;
        let first_event_id = events[0].event_id;
        let next_event_id = events[events.len() - 1].event_id + 1;
        let source_cluster = self
            .cluster_metadata
            .cluster_name_for_version(version)
            .to_string();

        let new_run_history = match &request.new_run_history {
            Some(blob) => deserialize_batch(blob)?,
            None => Vec::new(),
        };

        let request_out = ReplicateEventsRequest {
            source_cluster,
            domain_id: request.domain_id.clone(),
            execution: request.execution.clone(),
            first_event_id,
            next_event_id,
            version,
            replication_info: request.replication_info.clone(),
            history: events,
            new_run_history,
            event_store_version: request.event_store_version,
            new_run_event_store_version: request.new_run_event_store_version,
            force_buffer_events: true,
            reset_workflow: request.reset_workflow,
        };
        self.apply_events(token, &request_out, true).await
    }

    /// Apply a decoded replication task.
    #[instrument(skip(self, token, request), fields(
        workflow_id = %request.execution.workflow_id,
        run_id = %request.execution.run_id,
        source_cluster = %request.source_cluster,
        incoming_version = request.version,
        first_event_id = request.first_event_id,
        next_event_id = request.next_event_id,
    ))]
    pub async fn apply_events(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
        in_retry: bool,
    ) -> Result<()> {
        match self.apply_events_inner(token, request, in_retry).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.translate_boundary_error(err, request)),
        }
    }

    /// Synchronize one activity's state from the active cluster.
    #[instrument(skip(self, token, request), fields(
        workflow_id = %request.workflow_id,
        run_id = %request.run_id,
        scheduled_id = request.scheduled_id,
        incoming_version = request.version,
    ))]
    pub async fn sync_activity(
        &self,
        token: &CancellationToken,
        request: &SyncActivityRequest,
    ) -> Result<()> {
        let mut acquired = self
            .cache
            .acquire(
                token,
                &request.domain_id,
                &request.workflow_id,
                Some(&request.run_id),
            )
            .await?;
        let result = self.sync_activity_locked(&mut acquired, request).await;
        acquired.release(&result);
        result
    }

    // ========================================================================
    // ApplyEvents pipeline
    // ========================================================================

    /// Translate storage errors into the retriable taxonomy at the pipeline
    /// boundary.
    fn translate_boundary_error(
        &self,
        err: ReplicationError,
        request: &ReplicateEventsRequest,
    ) -> ReplicationError {
        match err {
            ReplicationError::Store(StoreError::ExecutionNotFound { .. }) => {
                debug!("encountered execution-not-found, returning retry");
                ReplicationError::retry_task(
                    RetryReason::EntityNotExists,
                    request.domain_id.as_str(),
                    request.execution.workflow_id.as_str(),
                    request.execution.run_id.as_str(),
                    None,
                )
            }
            ReplicationError::Store(StoreError::ExecutionAlreadyStarted { .. }) => {
                debug!("encountered execution-already-started, returning retry");
                ReplicationError::retry_task(
                    RetryReason::ExecutionAlreadyStarted,
                    request.domain_id.as_str(),
                    request.execution.workflow_id.as_str(),
                    request.execution.run_id.as_str(),
                    None,
                )
            }
            ReplicationError::InternalFailure { ref details } => {
                error!(details = %details, "encountered internal failure");
                err
            }
            other => other,
        }
    }

    async fn apply_events_inner(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
        in_retry: bool,
    ) -> Result<()> {
        let first_event = match request.first_event() {
            Some(event) => event,
            None => {
                warn!("dropping empty replication task");
                self.metrics.record_empty_events();
                return Ok(());
            }
        };

        let execution = &request.execution;
        let mut acquired = self
            .cache
            .acquire(
                token,
                &request.domain_id,
                &execution.workflow_id,
                Some(&execution.run_id),
            )
            .await?;

        match first_event.event_type() {
            EventType::WorkflowExecutionStarted => {
                match acquired.load_workflow_execution().await.map(|_| ()) {
                    Ok(()) => {
                        // Execution already exists; a duplicate start event
                        // is safe to ignore.
                        debug!("dropping stale replication task for start event");
                        self.metrics.record_duplicate_events();
                        acquired.release_clean();
                        Ok(())
                    }
                    Err(StoreError::ExecutionNotFound { .. }) => {
                        let result = self.apply_start_event(token, &mut acquired, request).await;
                        acquired.release(&result);
                        result
                    }
                    Err(err) => Err(err.into()),
                }
            }
            _ => {
                match acquired.load_workflow_execution().await.map(|_| ()) {
                    Err(StoreError::ExecutionNotFound { .. }) => {
                        // No state for this run id; decide against the
                        // workflow id's current run instead. The target
                        // context is released (with invalidation) first.
                        drop(acquired);
                        self.apply_other_events_missing_mutable_state(token, request)
                            .await
                    }
                    Err(err) => Err(err.into()),
                    Ok(()) => {
                        let result = self
                            .apply_other_events_existing(token, &mut acquired, request, in_retry)
                            .await;
                        acquired.release(&result);
                        result
                    }
                }
            }
        }
    }

    async fn apply_other_events_existing(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        request: &ReplicateEventsRequest,
        in_retry: bool,
    ) -> Result<()> {
        if let Err(err) = self.flush_replication_buffer(token, ctx).await {
            error!(error = %err, "fail to pre-flush buffer");
            return Err(err);
        }
        let proceed = self
            .apply_other_events_version_checking(token, ctx, request, in_retry)
            .await?;
        if !proceed {
            return Ok(());
        }
        self.apply_other_events(token, ctx, request).await
    }

    /// Start-event path: build fresh state and create the execution.
    async fn apply_start_event(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        request: &ReplicateEventsRequest,
    ) -> Result<()> {
        let ms = MutableState::new_for_replication(
            self.cluster_metadata.current_cluster_name(),
            request.version,
        );
        ctx.set_mutable_state(ms);
        self.apply_replication_task(token, ctx, request).await
    }

    /// Events for a run this cluster has never seen: decide against the
    /// workflow id's current run.
    async fn apply_other_events_missing_mutable_state(
        &self,
        token: &CancellationToken,
        request: &ReplicateEventsRequest,
    ) -> Result<()> {
        let domain_id = &request.domain_id;
        let workflow_id = &request.execution.workflow_id;
        let run_id = &request.execution.run_id;
        let incoming_version = request.version;
        let incoming_timestamp = request
            .last_event()
            .map(|event| event.timestamp)
            .unwrap_or_else(Utc::now);

        let retry_not_found = || {
            ReplicationError::retry_task(
                RetryReason::WorkflowNotFound,
                domain_id,
                workflow_id,
                run_id,
                Some(FIRST_EVENT_ID),
            )
        };

        // Inspect the current run, then let go of its lock before acting.
        let (current_run_id, current_last_write_version) = {
            let mut current = match self.cache.acquire(token, domain_id, workflow_id, None).await {
                Ok(current) => current,
                Err(ReplicationError::Store(StoreError::ExecutionNotFound { .. })) => {
                    return Err(retry_not_found());
                }
                Err(err) => return Err(err),
            };
            match current.load_workflow_execution().await {
                Ok(ms) => {
                    let out = (
                        ms.execution_info.run_id.clone(),
                        ms.last_write_version(),
                    );
                    current.release_clean();
                    out
                }
                Err(StoreError::ExecutionNotFound { .. }) => return Err(retry_not_found()),
                Err(err) => return Err(err.into()),
            }
        };

        if current_last_write_version > incoming_version {
            info!("dropping replication task");
            self.metrics.record_stale_events();
            return Ok(());
        }
        if current_last_write_version < incoming_version && !request.reset_workflow {
            match self
                .terminate_workflow(
                    token,
                    domain_id,
                    workflow_id,
                    &current_run_id,
                    incoming_version,
                    incoming_timestamp,
                )
                .await
            {
                Ok(()) => {}
                // The run may have closed just as the call was made; whether
                // it ended in continue-as-new is unknown, so keep going and
                // let the worker-level retry sort out any follow-up error.
                Err(ReplicationError::Store(StoreError::ExecutionNotFound { .. })) => {}
                Err(err) => return Err(err),
            }
            return Err(retry_not_found());
        }

        debug!(
            current_run_id = %current_run_id,
            current_last_write_version,
            incoming_version,
            "retrying replication task against current run"
        );

        let (current_run_id, current_next_event_id, current_still_running) = self
            .flush_current_workflow_buffer(token, domain_id, workflow_id)
            .await?;

        if current_still_running {
            return Err(ReplicationError::retry_task(
                RetryReason::WorkflowNotFound,
                domain_id,
                workflow_id,
                &current_run_id,
                Some(current_next_event_id),
            ));
        }

        if request.reset_workflow {
            // Current run is closed and its version does not exceed the
            // incoming one; hand over to the resetor.
            return self
                .reset_handler
                .apply_reset_event(token, request, &current_run_id)
                .await;
        }
        Err(retry_not_found())
    }

    /// Version checking: drop stale batches, pass through same-version
    /// batches, and resolve failover conflicts by rewinding. Returns whether
    /// the batch should still be applied.
    async fn apply_other_events_version_checking(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        request: &ReplicateEventsRequest,
        in_retry: bool,
    ) -> Result<bool> {
        let incoming_version = request.version;
        let (last_write_version, last_write_event_id) = {
            let ms = ms_of(ctx)?;
            (
                ms.last_write_version(),
                ms.replication_state.last_write_event_id,
            )
        };

        if last_write_version > incoming_version {
            // Local state is already past this version; only signals survive.
            info!("dropping stale replication task");
            self.metrics.record_stale_events();
            self.garbage_collect_signals(ctx, &request.history).await?;
            return Ok(false);
        }

        if last_write_version == incoming_version {
            return Ok(true);
        }

        // last_write_version < incoming_version: first batch after failover.
        let previous_active = self
            .cluster_metadata
            .cluster_name_for_version(last_write_version)
            .to_string();
        info!(
            previous_active = %previous_active,
            last_write_version,
            "first event after failover"
        );

        if previous_active != self.cluster_metadata.current_cluster_name() {
            // This cluster was not the previous active, so it holds no
            // unacked events and no buffered events.
            let dc_migration = self.config.enable_dc_migration && self.history_prober.is_some();
            if self
                .cluster_metadata
                .is_version_from_same_cluster(incoming_version, last_write_version)
                && !dc_migration
            {
                // A workflow can sit out rounds of failover without
                // authoring events; a pure version bump from the same origin
                // needs no reset.
                return Ok(true);
            }

            if dc_migration {
                if in_retry {
                    return Ok(true);
                }
                if let Some(prober) = &self.history_prober {
                    let expected_last_event_id = {
                        let ms = ms_of(ctx)?;
                        prober.last_match_event_id(request, ms).await?
                    };
                    if expected_last_event_id < last_write_event_id {
                        let last_event = last_event_of(request)?;
                        info!(
                            expected_last_event_id,
                            last_write_event_id, "resetting for datacenter migration"
                        );
                        self.reset_mutable_state(
                            token,
                            ctx,
                            expected_last_event_id,
                            last_event.version,
                            last_event.timestamp,
                        )
                        .await?;
                    }
                    return Ok(true);
                }
            }

            error!("replication task names a third cluster");
            return Err(ReplicationError::MoreThan2DataCenters);
        }

        // This cluster was the previous active: events it authored may never
        // have been acked by the remote, so trust the remote's replication
        // info over the local watermark.
        let remote_info = request.replication_info.get(&previous_active).copied();
        let local_info = {
            let ms = ms_of(ctx)?;
            ms.replication_state.last_replication_info.clone()
        };

        let remote_info = match remote_info {
            None => None,
            Some(ri) if last_write_version > ri.version => None,
            Some(ri) => Some(ri),
        };
        let Some(remote_info) = remote_info else {
            info!("encountered case where events are rejected by remote");
            let (last_valid_version, last_valid_event_id) =
                latest_checkpoint(&request.replication_info, &local_info);
            if last_valid_version == EMPTY_VERSION {
                error!("local and remote both are missing replication info");
                return Err(ReplicationError::MissingReplicationInfo);
            }
            info!(last_valid_event_id, "reset to latest common checkpoint");
            let last_event = last_event_of(request)?;
            self.reset_mutable_state(
                token,
                ctx,
                last_valid_event_id,
                incoming_version,
                last_event.timestamp,
            )
            .await?;
            return Ok(true);
        };

        if last_write_version < remote_info.version {
            error!("replication info contains higher version than this cluster ever emitted");
            return Err(ReplicationError::RemoteClaimedHigherVersion);
        }

        // Versions agree; compare event ids to detect divergence.
        if remote_info.last_event_id > last_write_event_id {
            error!("conflict detected, but cannot resolve");
            return Err(ReplicationError::CorruptedReplicationInfo);
        }

        self.flush_events_buffer(ctx).await?;

        let (last_write_event_id, has_buffered_events) = {
            let ms = ms_of(ctx)?;
            (
                ms.replication_state.last_write_event_id,
                ms.has_buffered_events(),
            )
        };
        if remote_info.last_event_id < last_write_event_id || has_buffered_events {
            // Buffered events delay id generation only; their effects are in
            // mutable state already, so divergence includes them.
            info!(
                remote_last_event_id = remote_info.last_event_id,
                last_write_event_id, "conflict detected"
            );
            let last_event = last_event_of(request)?;
            self.reset_mutable_state(
                token,
                ctx,
                remote_info.last_event_id,
                incoming_version,
                last_event.timestamp,
            )
            .await?;
        }
        Ok(true)
    }

    /// Apply in-order batches, park out-of-order ones, drop
    /// duplicates.
    async fn apply_other_events(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        request: &ReplicateEventsRequest,
    ) -> Result<()> {
        let first_event_id = request.first_event_id;
        let (next_event_id, is_running) = {
            let ms = ms_of(ctx)?;
            (ms.next_event_id(), ms.is_running())
        };

        if first_event_id < next_event_id {
            let ms = ms_of(ctx)?;
            debug!(
                next_event_id,
                current_version = ms.replication_state.current_version,
                last_write_version = ms.last_write_version(),
                last_write_event_id = ms.replication_state.last_write_event_id,
                "dropping duplicate replication task"
            );
            self.metrics.record_duplicate_events();
            return Ok(());
        }

        if first_event_id > next_event_id {
            if !is_running {
                warn!("workflow already terminated due to conflict resolution");
                return Ok(());
            }

            debug!(
                next_event_id,
                first_event_id, "buffering out of order replication task"
            );

            if !request.force_buffer_events {
                return Err(ReplicationError::retry_task(
                    RetryReason::BufferEvents,
                    ctx.domain_id(),
                    &ctx.execution().workflow_id,
                    &ctx.execution().run_id,
                    Some(next_event_id),
                ));
            }

            {
                let ms = ms_of(ctx)?;
                if let Some(existing) = ms.buffered_replication_tasks().get(&first_event_id) {
                    if existing.version >= request.version {
                        // An equal-or-newer batch is already parked here.
                        return Ok(());
                    }
                }
                ms.buffer_replication_task(request);
            }
            self.metrics.record_buffered_task();
            ctx.update_workflow_execution(Vec::new(), Vec::new())
                .await?;
            return Ok(());
        }

        self.apply_replication_task(token, ctx, request).await?;

        if let Err(err) = self.flush_replication_buffer(token, ctx).await {
            error!(error = %err, "fail to flush buffer");
            return Err(err);
        }
        Ok(())
    }

    /// Run the state builder and persist through the
    /// matching write path.
    fn apply_replication_task<'a>(
        &'a self,
        token: &'a CancellationToken,
        ctx: &'a mut ExecutionContext,
        request: &'a ReplicateEventsRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.apply_replication_task_impl(token, ctx, request))
    }

    async fn apply_replication_task_impl(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        request: &ReplicateEventsRequest,
    ) -> Result<()> {
        {
            let ms = ms_of(ctx)?;
            if !ms.is_running() {
                warn!("workflow already terminated due to conflict resolution");
                return Ok(());
            }
        }
        let first_event = match request.first_event() {
            Some(event) => event,
            None => return Ok(()),
        };

        // Request id for the execution row; not part of any history event.
        let request_id = Uuid::new_v4().to_string();
        let applied = {
            let ms = ms_of(ctx)?;
            self.state_builder.apply_events(
                ms,
                &request.domain_id,
                &request_id,
                &request.execution,
                &request.history,
                &request.new_run_history,
                request.event_store_version,
                request.new_run_event_store_version,
            )?
        };

        match first_event.event_type() {
            EventType::WorkflowExecutionStarted => {
                self.replicate_workflow_started(token, ctx, request, applied)
                    .await?;
            }
            _ => {
                let AppliedBatch {
                    last_event,
                    new_run,
                    transfer_tasks,
                    timer_tasks,
                    ..
                } = applied;

                // Continue-as-new: land the successor's first batch before
                // closing out the predecessor.
                let mut staged_new_run = None;
                if let Some(mut new_run) = new_run {
                    ctx.append_first_batch_history_for_continue_as_new(
                        &mut new_run.mutable_state,
                        &new_run.events,
                    )
                    .await?;
                    staged_new_run = Some(new_run);
                }

                ctx.replicate_workflow_execution(
                    &request.source_cluster,
                    &request.history,
                    transfer_tasks.clone(),
                    timer_tasks.clone(),
                )
                .await?;

                if let Some(mut new_run) = staged_new_run {
                    let new_last = new_run.events[new_run.events.len() - 1].clone();
                    new_run.mutable_state.update_replication_state_last_event(
                        &request.source_cluster,
                        new_last.version,
                        new_last.event_id,
                    );
                    let create = CreateWorkflowExecutionRequest {
                        mode: CreateWorkflowMode::WorkflowIdReuse {
                            prev_run_id: request.execution.run_id.clone(),
                            prev_last_write_version: last_event.version,
                        },
                        snapshot: new_run.mutable_state.to_snapshot(),
                        transfer_tasks: Vec::new(),
                        timer_tasks: Vec::new(),
                    };
                    match self.execution_store.create_workflow_execution(create).await {
                        Ok(()) => {}
                        Err(StoreError::ExecutionAlreadyStarted { run_id, .. })
                            if run_id == new_run.mutable_state.execution_info.run_id =>
                        {
                            // Successor already created by an earlier
                            // delivery of this batch.
                            self.metrics.record_duplicate_events();
                        }
                        Err(err) => return Err(err.into()),
                    }
                }

                let now = last_event.timestamp;
                self.notify(&request.source_cluster, now, &transfer_tasks, &timer_tasks);
            }
        }
        Ok(())
    }

    /// Persist a start-event batch: append history, then create the
    /// execution row, resolving workflow-id collisions version-aware.
    async fn replicate_workflow_started(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        request: &ReplicateEventsRequest,
        applied: AppliedBatch,
    ) -> Result<()> {
        let AppliedBatch {
            last_event,
            transfer_tasks,
            timer_tasks,
            ..
        } = applied;

        let mut ms = ctx
            .take_mutable_state()
            .ok_or_else(|| ReplicationError::InternalFailure {
                details: "start batch without mutable state".to_string(),
            })?;
        let domain_id = request.domain_id.clone();
        let execution = request.execution.clone();
        let first_event = &request.history[0];
        let incoming_version = first_event.version;

        let transaction_id = self.shard.next_transfer_task_id();
        ExecutionContext::append_batch(
            &self.history_store,
            &domain_id,
            &execution,
            &mut ms,
            &request.history,
            true,
            transaction_id,
        )
        .await?;
        ms.update_replication_state_last_event(
            &request.source_cluster,
            incoming_version,
            last_event.event_id,
        );

        let create = |mode: CreateWorkflowMode, ms: &MutableState| CreateWorkflowExecutionRequest {
            mode,
            snapshot: ms.to_snapshot(),
            transfer_tasks: transfer_tasks.clone(),
            timer_tasks: timer_tasks.clone(),
        };

        let first_attempt = self
            .execution_store
            .create_workflow_execution(create(CreateWorkflowMode::BrandNew, &ms))
            .await;

        let err = match first_attempt {
            Ok(()) => {
                ms.refresh_condition();
                ctx.set_mutable_state(ms);
                self.notify(
                    &request.source_cluster,
                    last_event.timestamp,
                    &transfer_tasks,
                    &timer_tasks,
                );
                return Ok(());
            }
            Err(err) => err,
        };

        let (current_run_id, current_state, current_last_write_version) = match err {
            StoreError::ExecutionAlreadyStarted {
                run_id,
                state,
                last_write_version,
                ..
            } => (run_id, state, last_write_version),
            other => {
                info!(error = %other, "create workflow failed after appending history events");
                return Err(other.into());
            }
        };

        info!(
            current_run_id = %current_run_id,
            current_last_write_version,
            "create workflow hit existing execution"
        );

        if current_run_id == execution.run_id {
            debug!("dropping duplicate start replication task");
            self.metrics.record_duplicate_events();
            return Ok(());
        }

        if current_state == WorkflowState::Completed {
            // Missing replication events can leave the current run closed at
            // a higher version; creation is still allowed.
            self.execution_store
                .create_workflow_execution(create(
                    CreateWorkflowMode::WorkflowIdReuse {
                        prev_run_id: current_run_id,
                        prev_last_write_version: current_last_write_version,
                    },
                    &ms,
                ))
                .await?;
            ms.refresh_condition();
            ctx.set_mutable_state(ms);
            self.notify(
                &request.source_cluster,
                last_event.timestamp,
                &transfer_tasks,
                &timer_tasks,
            );
            return Ok(());
        }

        // Current run still open.
        if current_last_write_version > incoming_version {
            info!("dropping stale start replication task");
            self.metrics.record_stale_events();
            self.delete_half_written_history(&ms, &domain_id, &execution)
                .await;
            return Ok(());
        }

        if current_last_write_version == incoming_version {
            let (current_run_id, current_next_event_id, _running) = self
                .flush_current_workflow_buffer(token, &domain_id, &execution.workflow_id)
                .await?;
            return Err(ReplicationError::retry_task(
                RetryReason::ExecutionAlreadyStarted,
                &domain_id,
                &execution.workflow_id,
                &current_run_id,
                Some(current_next_event_id),
            ));
        }

        // current_last_write_version < incoming_version: the remote active
        // cannot know about the current run, so terminate it and create the
        // incoming one.
        let incoming_timestamp = last_event.timestamp;
        match self
            .terminate_workflow(
                token,
                &domain_id,
                &execution.workflow_id,
                &current_run_id,
                incoming_version,
                incoming_timestamp,
            )
            .await
        {
            Ok(()) => {}
            Err(ReplicationError::Store(StoreError::ExecutionNotFound { .. })) => {}
            Err(err) => return Err(err),
        }
        self.execution_store
            .create_workflow_execution(create(
                CreateWorkflowMode::WorkflowIdReuse {
                    prev_run_id: current_run_id,
                    prev_last_write_version: incoming_version,
                },
                &ms,
            ))
            .await?;
        ms.refresh_condition();
        ctx.set_mutable_state(ms);
        self.notify(
            &request.source_cluster,
            last_event.timestamp,
            &transfer_tasks,
            &timer_tasks,
        );
        Ok(())
    }

    /// Remove the history appended for a start batch that is being dropped.
    async fn delete_half_written_history(
        &self,
        ms: &MutableState,
        domain_id: &str,
        execution: &WorkflowExecution,
    ) {
        let result = match ms.execution_info.event_store_version {
            meridian_protocol::EventStoreVersion::V2 => match &ms.execution_info.branch_token {
                Some(branch_token) => self.history_store.delete_history_branch(branch_token).await,
                None => Ok(()),
            },
            meridian_protocol::EventStoreVersion::V1 => {
                self.history_store
                    .delete_workflow_execution_history(domain_id, execution)
                    .await
            }
        };
        if let Err(err) = result {
            warn!(error = %err, "failed to delete history of dropped start batch");
        }
    }

    // ========================================================================
    // Buffering and flush
    // ========================================================================

    /// Two-phase flush of the buffered replication tasks: GC stale batches
    /// (preserving their signals), then apply in-order batches until the
    /// buffer stalls.
    fn flush_replication_buffer<'a>(
        &'a self,
        token: &'a CancellationToken,
        ctx: &'a mut ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.flush_replication_buffer_impl(token, ctx))
    }

    async fn flush_replication_buffer_impl(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        {
            let ms = ms_of(ctx)?;
            if !ms.is_running() {
                return Ok(());
            }
        }

        let mut flushed_events: u64 = 0;

        // Phase 1: drop buffered batches the current version already passed,
        // keeping their signals.
        let stale_keys: Vec<i64> = {
            let ms = ms_of(ctx)?;
            let last_write_version = ms.last_write_version();
            ms.buffered_replication_tasks()
                .values()
                .filter(|bt| bt.version < last_write_version)
                .map(|bt| bt.first_event_id)
                .collect()
        };
        for key in stale_keys {
            let removed = {
                let ms = ms_of(ctx)?;
                if !ms.is_running() {
                    break;
                }
                ms.delete_buffered_replication_task(key)
            };
            let Some(stale_task) = removed else { continue };
            let applied = self
                .garbage_collect_signals(ctx, &stale_task.events)
                .await?;
            if !applied {
                // Persist the deletion even when no signal survived.
                ctx.update_workflow_execution(Vec::new(), Vec::new())
                    .await?;
            }
        }

        // Phase 2: apply buffered batches in order while the gap stays
        // closed.
        loop {
            let next_task = {
                let ms = ms_of(ctx)?;
                if !ms.is_running() || !ms.has_buffered_replication_tasks() {
                    break;
                }
                let next_event_id = ms.next_event_id();
                match ms.buffered_replication_tasks().get(&next_event_id) {
                    Some(bt) => {
                        let bt = bt.clone();
                        // Delete before applying so the delete rides the
                        // same conditional write as the apply.
                        ms.delete_buffered_replication_task(next_event_id);
                        bt
                    }
                    None => break,
                }
            };

            let source_cluster = self
                .cluster_metadata
                .cluster_name_for_version(next_task.version)
                .to_string();
            let replay = ReplicateEventsRequest {
                source_cluster,
                domain_id: ctx.domain_id().to_string(),
                execution: ctx.execution().clone(),
                first_event_id: next_task.first_event_id,
                next_event_id: next_task.next_event_id,
                version: next_task.version,
                replication_info: Default::default(),
                history: next_task.events,
                new_run_history: next_task.new_run_events,
                event_store_version: next_task.event_store_version,
                new_run_event_store_version: next_task.new_run_event_store_version,
                force_buffer_events: false,
                reset_workflow: false,
            };
            self.apply_replication_task(token, ctx, &replay).await?;
            flushed_events += (next_task.next_event_id - next_task.first_event_id) as u64;
        }

        if flushed_events > 0 {
            self.metrics.record_flushed_events(flushed_events);
        }
        Ok(())
    }

    /// Flush the current run's buffer and report where it stands.
    async fn flush_current_workflow_buffer(
        &self,
        token: &CancellationToken,
        domain_id: &str,
        workflow_id: &str,
    ) -> Result<(String, i64, bool)> {
        let mut current = self.cache.acquire(token, domain_id, workflow_id, None).await?;
        let result = async {
            current.load_workflow_execution().await.map(|_| ())?;
            // The incoming run cannot make progress while the current run is
            // open; flushing its buffer may move it forward.
            self.flush_replication_buffer(token, &mut current).await?;
            let ms = ms_of(&mut current)?;
            Ok::<(String, i64, bool), ReplicationError>((
                ms.execution_info.run_id.clone(),
                ms.next_event_id(),
                ms.is_running(),
            ))
        }
        .await;
        if let Err(err) = &result {
            error!(error = %err, "fail to flush buffer for current workflow");
        }
        current.release(&result);
        result
    }

    /// Release active-side buffered events by failing the in-flight
    /// decision, so replication can rewind cleanly.
    async fn flush_events_buffer(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let decision = {
            let ms = ms_of(ctx)?;
            if !ms.is_running()
                || !ms.has_buffered_events()
                || !self.can_modify_workflow(ms)
            {
                return Ok(());
            }
            ms.get_in_flight_decision().cloned()
        };
        let decision = decision.ok_or(ReplicationError::CorruptedMutableStateDecision)?;

        {
            let ms = ms_of(ctx)?;
            let last_write_version = ms.last_write_version();
            ms.update_replication_state_version(last_write_version, true);
            ms.add_decision_task_failed_event(
                decision.schedule_id,
                decision.started_id,
                DecisionTaskFailedCause::FailoverCloseDecision,
                HISTORY_SERVICE_IDENTITY,
            );
        }
        // No replacement decision or decision timer; the intent is only to
        // flush the buffered events.
        ctx.update_workflow_execution(Vec::new(), Vec::new()).await?;
        Ok(())
    }

    /// Re-apply signal events from a stale batch to mutable state. Signals
    /// survive version drops; everything else is discarded.
    async fn garbage_collect_signals(
        &self,
        ctx: &mut ExecutionContext,
        events: &[HistoryEvent],
    ) -> Result<bool> {
        {
            let ms = ms_of(ctx)?;
            if !ms.is_running() || !self.can_modify_workflow(ms) {
                return Ok(false);
            }
            let last_write_version = ms.last_write_version();
            ms.update_replication_state_version(last_write_version, true);
            let mut applied = false;
            for event in events {
                if let EventAttributes::WorkflowExecutionSignaled {
                    signal_name,
                    input,
                    identity,
                } = &event.attributes
                {
                    ms.add_workflow_execution_signaled_event(
                        signal_name,
                        input.clone(),
                        identity,
                    );
                    applied = true;
                }
            }
            if !applied {
                return Ok(false);
            }
        }
        ctx.update_workflow_execution(Vec::new(), Vec::new()).await?;
        Ok(true)
    }

    // ========================================================================
    // Conflict resolution
    // ========================================================================

    /// Rewind mutable state to `last_event_id`, terminating any
    /// continue-as-new successor first.
    async fn reset_mutable_state(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        last_event_id: i64,
        incoming_version: i64,
        incoming_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.metrics.record_history_conflict();

        let current_run_id = self
            .conflict_resolution_terminate_current_running_if_not_self(
                token,
                ctx,
                incoming_version,
                incoming_timestamp,
            )
            .await?;

        let (execution_info, prev_replication_info, condition) = {
            let ms = ms_of(ctx)?;
            (
                ms.execution_info.clone(),
                ms.replication_state.last_replication_info.clone(),
                ms.condition(),
            )
        };
        let new_ms = self
            .conflict_resolver
            .reset(
                &current_run_id,
                &Uuid::new_v4().to_string(),
                last_event_id,
                &execution_info,
                prev_replication_info,
                condition,
            )
            .await?;
        ctx.set_mutable_state(new_ms);
        Ok(())
    }

    /// When the run being reset already continued as new, terminate its
    /// open successor if the incoming version outranks it.
    async fn conflict_resolution_terminate_current_running_if_not_self(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        incoming_version: i64,
        incoming_timestamp: DateTime<Utc>,
    ) -> Result<String> {
        let (is_running, run_id, domain_id, workflow_id) = {
            let ms = ms_of(ctx)?;
            (
                ms.is_running(),
                ms.execution_info.run_id.clone(),
                ms.execution_info.domain_id.clone(),
                ms.execution_info.workflow_id.clone(),
            )
        };
        if is_running {
            info!("conflict resolution self workflow running, skip");
            return Ok(run_id);
        }

        // The current run cannot be fetched through the cache here: the held
        // lock and a workflow-id acquisition can deadlock.
        let current = self
            .execution_store
            .get_current_execution(&domain_id, &workflow_id)
            .await
            .map_err(|err| {
                error!(error = %err, "conflict resolution error getting current workflow");
                ReplicationError::from(err)
            })?;

        if current.close_status != crate::persistence::CloseStatus::None {
            // A current run can never close as continue-as-new.
            info!("conflict resolution current workflow finished");
            return Ok(current.run_id);
        }

        if let Err(err) = self
            .terminate_workflow(
                token,
                &domain_id,
                &workflow_id,
                &current.run_id,
                incoming_version,
                incoming_timestamp,
            )
            .await
        {
            error!(error = %err, "conflict resolution error terminating current workflow");
            return Err(err);
        }
        Ok(current.run_id)
    }

    /// Terminate a run with a synthetic termination event carrying the
    /// incoming version, routed through the normal replication apply path so
    /// bookkeeping stays consistent.
    fn terminate_workflow<'a>(
        &'a self,
        token: &'a CancellationToken,
        domain_id: &'a str,
        workflow_id: &'a str,
        run_id: &'a str,
        incoming_version: i64,
        incoming_timestamp: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut acquired = self
                .cache
                .acquire(token, domain_id, workflow_id, Some(run_id))
                .await?;
            let result = self
                .terminate_workflow_locked(
                    token,
                    &mut acquired,
                    domain_id,
                    workflow_id,
                    run_id,
                    incoming_version,
                    incoming_timestamp,
                )
                .await;
            acquired.release(&result);
            result
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn terminate_workflow_locked(
        &self,
        token: &CancellationToken,
        ctx: &mut ExecutionContext,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        incoming_version: i64,
        incoming_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        ctx.load_workflow_execution().await.map(|_| ())?;
        let (is_running, next_event_id, event_store_version) = {
            let ms = ms_of(ctx)?;
            (
                ms.is_running(),
                ms.next_event_id(),
                ms.execution_info.event_store_version,
            )
        };
        if !is_running {
            return Ok(());
        }

        let source_cluster = self
            .cluster_metadata
            .cluster_name_for_version(incoming_version)
            .to_string();
        let termination_event = HistoryEvent {
            event_id: next_event_id,
            version: incoming_version,
            timestamp: incoming_timestamp,
            attributes: EventAttributes::WorkflowExecutionTerminated {
                reason: WORKFLOW_TERMINATION_REASON.to_string(),
                identity: WORKFLOW_TERMINATION_IDENTITY.to_string(),
                details: None,
            },
        };
        let request = ReplicateEventsRequest {
            source_cluster,
            domain_id: domain_id.to_string(),
            execution: WorkflowExecution {
                workflow_id: workflow_id.to_string(),
                run_id: run_id.to_string(),
            },
            first_event_id: next_event_id,
            next_event_id: next_event_id + 1,
            version: incoming_version,
            replication_info: Default::default(),
            history: vec![termination_event],
            new_run_history: Vec::new(),
            event_store_version,
            new_run_event_store_version: event_store_version,
            force_buffer_events: false,
            reset_workflow: false,
        };
        self.apply_replication_task(token, ctx, &request).await
    }

    // ========================================================================
    // SyncActivity
    // ========================================================================

    async fn sync_activity_locked(
        &self,
        ctx: &mut ExecutionContext,
        request: &SyncActivityRequest,
    ) -> Result<()> {
        // Sync activity tasks are only sent by the active side when an
        // activity with a retry policy starts or heartbeats.
        match ctx.load_workflow_execution().await.map(|_| ()) {
            Ok(()) => {}
            Err(StoreError::ExecutionNotFound { .. }) => {
                // Start event and sync task can arrive out of order, or the
                // run is long gone; drop rather than exhaust worker retries
                // into the DLQ.
                self.metrics.record_sync_activity_dropped();
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let version = request.version;
        let schedule_id = request.scheduled_id;
        {
            let ms = ms_of(ctx)?;
            if !ms.is_running() {
                // Perhaps conflict resolution force-terminated the run.
                self.metrics.record_sync_activity_dropped();
                return Ok(());
            }

            if schedule_id >= ms.next_event_id() {
                if version < ms.last_write_version() {
                    self.metrics.record_sync_activity_dropped();
                    return Ok(());
                }
                // Out-of-order delivery; ask for the scheduled event first.
                return Err(ReplicationError::retry_task(
                    RetryReason::SyncActivity,
                    &request.domain_id,
                    &request.workflow_id,
                    &request.run_id,
                    Some(ms.next_event_id()),
                ));
            }

            let Some(ai) = ms.get_activity(schedule_id) else {
                // Activity already finished; out-of-order delivery.
                self.metrics.record_sync_activity_dropped();
                return Ok(());
            };

            if ai.version > version {
                self.metrics.record_sync_activity_dropped();
                return Ok(());
            }
            if ai.version == version {
                if ai.attempt > request.attempt {
                    self.metrics.record_sync_activity_dropped();
                    return Ok(());
                }
                if ai.attempt == request.attempt {
                    let stale_heartbeat = match (ai.last_heartbeat_time, request.last_heartbeat_time)
                    {
                        (Some(existing), Some(incoming)) => existing > incoming,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    if stale_heartbeat {
                        self.metrics.record_sync_activity_dropped();
                        return Ok(());
                    }
                }
            }

            // Reset the timer-creation bits when the update crosses cluster
            // families or advances the attempt.
            let reset_timer_bits = !self
                .cluster_metadata
                .is_version_from_same_cluster(version, ai.version)
                || ai.attempt < request.attempt;
            ms.replicate_activity_info(request, reset_timer_bits)?;
        }

        let event_time = [
            request.scheduled_time,
            request.started_time,
            request.last_heartbeat_time,
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or_else(Utc::now);

        let timer_tasks = {
            let ms = ms_of(ctx)?;
            activity_timer_if_needed(ms, event_time).into_iter().collect()
        };
        ctx.update_workflow_execution(Vec::new(), timer_tasks)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Whether the local cluster may author events on this run.
    fn can_modify_workflow(&self, ms: &MutableState) -> bool {
        let last_write_version = ms.last_write_version();
        self.cluster_metadata
            .cluster_name_for_version(last_write_version)
            == self.cluster_metadata.current_cluster_name()
    }

    /// Advance the standby clock and wake the local processors.
    fn notify(
        &self,
        source_cluster: &str,
        now: DateTime<Utc>,
        transfer_tasks: &[crate::persistence::TransferTask],
        timer_tasks: &[crate::persistence::TimerTask],
    ) {
        let delay = Duration::seconds(self.config.standby_cluster_delay.as_secs() as i64);
        let now = now - delay;
        self.shard.set_current_time(source_cluster, now);
        self.notifier.notify_transfer_tasks(source_cluster, transfer_tasks);
        self.notifier.notify_timer_tasks(source_cluster, now, timer_tasks);
    }
}

/// The run's mutable state, which the caller has already loaded or built.
fn ms_of(ctx: &mut ExecutionContext) -> Result<&mut MutableState> {
    ctx.mutable_state()
        .ok_or_else(|| ReplicationError::InternalFailure {
            details: "mutable state not loaded".to_string(),
        })
}

fn last_event_of(request: &ReplicateEventsRequest) -> Result<&HistoryEvent> {
    request
        .last_event()
        .ok_or_else(|| ReplicationError::InternalFailure {
            details: "replication task without events".to_string(),
        })
}

/// Highest-version entry across the remote and local replication-info maps.
fn latest_checkpoint(
    remote: &std::collections::HashMap<String, ReplicationInfo>,
    local: &std::collections::HashMap<String, ReplicationInfo>,
) -> (i64, i64) {
    let mut last_valid_version = EMPTY_VERSION;
    let mut last_valid_event_id = crate::persistence::EMPTY_EVENT_ID;
    for ri in remote.values().chain(local.values()) {
        if last_valid_version == EMPTY_VERSION || ri.version > last_valid_version {
            last_valid_version = ri.version;
            last_valid_event_id = ri.last_event_id;
        }
    }
    (last_valid_version, last_valid_event_id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn info(version: i64, last_event_id: i64) -> ReplicationInfo {
        ReplicationInfo {
            version,
            last_event_id,
        }
    }

    #[test]
    fn test_latest_checkpoint_prefers_highest_version() {
        let mut remote = HashMap::new();
        remote.insert("dc-east".to_string(), info(20, 5));
        let mut local = HashMap::new();
        local.insert("dc-west".to_string(), info(10, 3));

        assert_eq!(latest_checkpoint(&remote, &local), (20, 5));
        assert_eq!(latest_checkpoint(&local, &remote), (20, 5));
    }

    #[test]
    fn test_latest_checkpoint_empty_maps() {
        let empty = HashMap::new();
        let (version, event_id) = latest_checkpoint(&empty, &empty);
        assert_eq!(version, EMPTY_VERSION);
        assert_eq!(event_id, crate::persistence::EMPTY_EVENT_ID);
    }
}
