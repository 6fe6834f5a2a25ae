// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Meridian History - Cross-Datacenter Replication Core
//!
//! This crate is the standby-side heart of meridian's cross-datacenter story.
//! Every workflow execution lives on a shard with exactly one active cluster
//! at a time; the active cluster authors history events and ships them to its
//! peers as replication tasks. This crate ingests those tasks and rebuilds
//! the same mutable state locally, preserving a total per-execution event
//! order across failovers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     Replication Worker (host)                    │
//! │          receives tasks from peer clusters, retries, DLQ         │
//! └──────────────────────────────────────────────────────────────────┘
//!                │ ApplyRawEvents / ApplyEvents / SyncActivity
//!                ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      HistoryReplicator                           │
//! │   version checking · buffering · conflict reset · termination    │
//! └──────────────────────────────────────────────────────────────────┘
//!      │                │                  │                 │
//!      ▼                ▼                  ▼                 ▼
//! ┌───────────┐  ┌──────────────┐  ┌───────────────┐  ┌─────────────┐
//! │ Execution │  │ StateBuilder │  │   Conflict    │  │ ShardContext│
//! │   Cache   │  │ MutableState │  │   Resolver    │  │ + Notifier  │
//! └───────────┘  └──────────────┘  └───────────────┘  └─────────────┘
//!      │                │                  │                 │
//!      └────────────────┴────────┬─────────┴─────────────────┘
//!                                ▼
//!              ┌─────────────────────────────────────┐
//!              │  ExecutionStore  /  HistoryStore    │
//!              │  (conditional writes, append-only)  │
//!              └─────────────────────────────────────┘
//! ```
//!
//! # Responsibilities
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `ApplyRawEvents` | Decode an encoded batch, then apply with buffering forced on |
//! | `ApplyEvents` | Apply a decoded batch: order, buffer, resolve, persist |
//! | `SyncActivity` | Fast-path replication of activity heartbeat state |
//!
//! Out-of-order batches are parked inside mutable state until the event-id
//! gap closes. Batches from a version the run has already passed are dropped,
//! except that their signal events are re-applied so user-visible signals
//! survive failovers. When the replication-info vector shows local history
//! diverged from the incoming stream, mutable state is rewound to the latest
//! common checkpoint and rebuilt from persisted history.
//!
//! # Error contract
//!
//! Success means "applied or intentionally dropped". Retriable errors
//! ([`ReplicationError::RetryTask`]) mean "resubmit later" and carry a hint
//! telling the sender where this cluster stands. Bad-request errors mean
//! "quarantine the task"; they are never worth retrying. Storage errors pass
//! through unchanged for outer retry.
//!
//! # Modules
//!
//! - [`cache`]: per-shard execution cache with exclusive per-run locks
//! - [`cluster`]: failover-version arithmetic
//! - [`config`]: runtime configuration from environment variables
//! - [`conflict_resolver`]: mutable-state rewind to a common checkpoint
//! - [`context`]: per-run execution context and write paths
//! - [`error`]: the closed replication error taxonomy
//! - [`metrics`]: drop/conflict counters
//! - [`mutable_state`]: in-memory materialization of one run
//! - [`persistence`]: storage traits, records, and the in-memory backend
//! - [`replicator`]: the coordinator state machine
//! - [`shard`]: shard-scoped sequencer, standby clock, processor notifier
//! - [`state_builder`]: event application and task derivation

#![deny(missing_docs)]

/// Per-shard workflow-execution cache.
pub mod cache;

/// Failover-version arithmetic.
pub mod cluster;

/// Configuration loading from environment variables.
pub mod config;

/// Conflict resolution by mutable-state rewind.
pub mod conflict_resolver;

/// Exclusive per-run execution context.
pub mod context;

/// Error types for history replication.
pub mod error;

/// Replication counters.
pub mod metrics;

/// In-memory materialization of one workflow run.
pub mod mutable_state;

/// Persistence interfaces and backends.
pub mod persistence;

/// The replicator coordinator.
pub mod replicator;

/// Per-shard runtime state.
pub mod shard;

/// Event application and task derivation.
pub mod state_builder;

pub use cache::{AcquiredContext, ExecutionCache};
pub use cluster::{ClusterInfo, ClusterMetadata, EMPTY_VERSION};
pub use config::{Config, ConfigError};
pub use error::{ReplicationError, Result, RetryReason};
pub use metrics::{MetricsSnapshot, ReplicationMetrics};
pub use mutable_state::MutableState;
pub use replicator::{
    HistoryProber, HistoryReplicator, NoopResetHandler, ResetHandler,
    WORKFLOW_TERMINATION_IDENTITY, WORKFLOW_TERMINATION_REASON,
};
pub use shard::{Notifier, NoopNotifier, ShardContext};
