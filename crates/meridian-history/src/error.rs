// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for history replication.
//!
//! The taxonomy is a closed enum so callers can handle every class
//! exhaustively: retriable errors tell the replication worker to resubmit the
//! task later (with a resynchronization hint), bad-request errors tell it to
//! quarantine the task in a dead-letter queue, and storage errors pass
//! through unchanged for outer retry. Stale/duplicate/empty tasks are not
//! errors at all; they are dropped silently and counted.

use std::fmt;

use crate::persistence::StoreError;
use meridian_protocol::BlobError;

/// Result type using ReplicationError
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Which retriable condition was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// Target execution does not exist yet; redeliver after its start event.
    EntityNotExists,
    /// No execution for this workflow id yet; redeliver later.
    WorkflowNotFound,
    /// Events arrived out of order and buffering was not forced.
    BufferEvents,
    /// Activity sync arrived ahead of its scheduled event.
    SyncActivity,
    /// Another execution with the same workflow id is in the way.
    ExecutionAlreadyStarted,
}

impl RetryReason {
    fn message(&self) -> &'static str {
        match self {
            RetryReason::EntityNotExists => "entity not exists",
            RetryReason::WorkflowNotFound => "retry on workflow not found",
            RetryReason::BufferEvents => "retry on applying buffer events",
            RetryReason::SyncActivity => "retry on applying sync activity",
            RetryReason::ExecutionAlreadyStarted => "another workflow execution is running",
        }
    }
}

/// Errors surfaced by the history replicator.
#[derive(Debug, Clone)]
pub enum ReplicationError {
    /// Resubmit the task later. Carries a hint telling the sender where the
    /// receiver stands so it can resynchronize.
    RetryTask {
        /// Which retriable condition was hit.
        reason: RetryReason,
        /// Domain of the execution the hint refers to.
        domain_id: String,
        /// Workflow id the hint refers to.
        workflow_id: String,
        /// Run id the hint refers to, when known.
        run_id: String,
        /// The receiver's next event id, when known.
        next_event_id: Option<i64>,
    },

    /// The source cluster's replication info contradicts local state.
    CorruptedReplicationInfo,

    /// Mutable state claims buffered events but has no in-flight decision.
    CorruptedMutableStateDecision,

    /// Version arithmetic names a third cluster; this deployment assumes two.
    MoreThan2DataCenters,

    /// Neither side carries replication info for the conflicting range.
    MissingReplicationInfo,

    /// The remote claims to have seen a higher version than this cluster
    /// ever emitted.
    RemoteClaimedHigherVersion,

    /// The event batch declares an encoding this cluster does not speak.
    UnknownEncoding {
        /// Declared encoding tag.
        encoding: String,
    },

    /// A raw replication task carried a zero-event batch.
    EmptyEventBatch,

    /// Cache acquisition lost its context before the lock became available.
    AcquireTimeout {
        /// Workflow whose lock was being acquired.
        workflow_id: String,
    },

    /// Code bug; the task cannot be applied and must be quarantined.
    InternalFailure {
        /// What went wrong.
        details: String,
    },

    /// Storage error surfaced unchanged for outer retry.
    Store(StoreError),
}

impl ReplicationError {
    /// Build a retriable error with a resynchronization hint.
    pub fn retry_task(
        reason: RetryReason,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
        next_event_id: Option<i64>,
    ) -> Self {
        ReplicationError::RetryTask {
            reason,
            domain_id: domain_id.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            next_event_id,
        }
    }

    /// Whether the caller should resubmit this task later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::RetryTask { .. }
                | ReplicationError::AcquireTimeout { .. }
                | ReplicationError::Store(_)
        )
    }

    /// Whether the task must be quarantined instead of retried.
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            ReplicationError::CorruptedReplicationInfo
                | ReplicationError::CorruptedMutableStateDecision
                | ReplicationError::MoreThan2DataCenters
                | ReplicationError::MissingReplicationInfo
                | ReplicationError::RemoteClaimedHigherVersion
                | ReplicationError::UnknownEncoding { .. }
                | ReplicationError::EmptyEventBatch
                | ReplicationError::InternalFailure { .. }
        )
    }

    /// Stable code string for this error class.
    pub fn error_code(&self) -> &'static str {
        match self {
            ReplicationError::RetryTask { reason, .. } => match reason {
                RetryReason::EntityNotExists => "RETRY_ENTITY_NOT_EXISTS",
                RetryReason::WorkflowNotFound => "RETRY_WORKFLOW_NOT_FOUND",
                RetryReason::BufferEvents => "RETRY_BUFFER_EVENTS",
                RetryReason::SyncActivity => "RETRY_SYNC_ACTIVITY",
                RetryReason::ExecutionAlreadyStarted => "RETRY_EXECUTION_ALREADY_STARTED",
            },
            ReplicationError::CorruptedReplicationInfo => "CORRUPTED_REPLICATION_INFO",
            ReplicationError::CorruptedMutableStateDecision => "CORRUPTED_MUTABLE_STATE_DECISION",
            ReplicationError::MoreThan2DataCenters => "MORE_THAN_2_DATA_CENTERS",
            ReplicationError::MissingReplicationInfo => "MISSING_REPLICATION_INFO",
            ReplicationError::RemoteClaimedHigherVersion => "REMOTE_CLAIMED_HIGHER_VERSION",
            ReplicationError::UnknownEncoding { .. } => "UNKNOWN_ENCODING",
            ReplicationError::EmptyEventBatch => "EMPTY_EVENT_BATCH",
            ReplicationError::AcquireTimeout { .. } => "ACQUIRE_TIMEOUT",
            ReplicationError::InternalFailure { .. } => "INTERNAL_FAILURE",
            ReplicationError::Store(_) => "STORE_ERROR",
        }
    }
}

impl fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationError::RetryTask {
                reason,
                domain_id,
                workflow_id,
                run_id,
                next_event_id,
            } => {
                write!(
                    f,
                    "{}: domain={} workflow={} run={} next_event_id={:?}",
                    reason.message(),
                    domain_id,
                    workflow_id,
                    run_id,
                    next_event_id
                )
            }
            ReplicationError::CorruptedReplicationInfo => {
                write!(f, "replication task has corrupted cluster replication info")
            }
            ReplicationError::CorruptedMutableStateDecision => {
                write!(f, "mutable state decision is corrupted")
            }
            ReplicationError::MoreThan2DataCenters => {
                write!(f, "more than 2 data center")
            }
            ReplicationError::MissingReplicationInfo => {
                write!(f, "local and remote both are missing replication info")
            }
            ReplicationError::RemoteClaimedHigherVersion => {
                write!(
                    f,
                    "replication info contains higher version than this cluster ever emitted"
                )
            }
            ReplicationError::UnknownEncoding { encoding } => {
                write!(f, "unknown encoding type: {}", encoding)
            }
            ReplicationError::EmptyEventBatch => {
                write!(f, "encountered empty history batch")
            }
            ReplicationError::AcquireTimeout { workflow_id } => {
                write!(
                    f,
                    "timed out acquiring execution lock for workflow '{}'",
                    workflow_id
                )
            }
            ReplicationError::InternalFailure { details } => {
                write!(f, "fail to apply history events due to bug: {}", details)
            }
            ReplicationError::Store(err) => write!(f, "storage error: {}", err),
        }
    }
}

impl std::error::Error for ReplicationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReplicationError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ReplicationError {
    fn from(err: StoreError) -> Self {
        ReplicationError::Store(err)
    }
}

impl From<BlobError> for ReplicationError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::UnknownEncoding(encoding) => ReplicationError::UnknownEncoding { encoding },
            BlobError::EmptyBatch => ReplicationError::EmptyEventBatch,
            BlobError::Corrupt(e) => ReplicationError::InternalFailure {
                details: format!("corrupt event batch: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = ReplicationError::retry_task(
            RetryReason::BufferEvents,
            "domain",
            "wf",
            "run",
            Some(7),
        );
        assert_eq!(err.error_code(), "RETRY_BUFFER_EVENTS");
        assert!(err.is_retryable());
        assert!(!err.is_bad_request());

        let err = ReplicationError::CorruptedReplicationInfo;
        assert_eq!(err.error_code(), "CORRUPTED_REPLICATION_INFO");
        assert!(err.is_bad_request());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_blob_error_translation() {
        let err: ReplicationError = BlobError::UnknownEncoding("thrift-rw".to_string()).into();
        assert_eq!(err.error_code(), "UNKNOWN_ENCODING");
        assert!(err.is_bad_request());

        let err: ReplicationError = BlobError::EmptyBatch.into();
        assert_eq!(err.error_code(), "EMPTY_EVENT_BATCH");
    }

    #[test]
    fn test_retry_hint_display() {
        let err =
            ReplicationError::retry_task(RetryReason::SyncActivity, "d1", "wf-1", "run-1", Some(12));
        let rendered = err.to_string();
        assert!(rendered.contains("retry on applying sync activity"));
        assert!(rendered.contains("next_event_id=Some(12)"));
    }
}
