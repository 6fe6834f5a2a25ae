// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Meridian Protocol - Cross-Cluster Replication Wire Types
//!
//! This crate defines the data model that crosses the cluster boundary during
//! history replication:
//!
//! - [`events`]: history events, the append-only record of a workflow run
//! - [`blob`]: opaque encoded event batches and their codec
//! - [`requests`]: replication and activity-sync request payloads
//!
//! The crate is transport-agnostic. Batches of history events travel between
//! clusters as [`blob::DataBlob`] values whose encoding is declared inline;
//! the receiving side decodes them with [`blob::deserialize_batch`] before
//! feeding them to the history replicator.
//!
//! # Event model
//!
//! Every workflow run is a monotonically numbered, gap-free sequence of
//! [`events::HistoryEvent`] values. Event ids are 1-based per run; the
//! failover `version` stamped on each event encodes the authoring cluster and
//! is non-decreasing within a run.

pub mod blob;
pub mod events;
pub mod requests;

pub use blob::{deserialize_batch, serialize_batch, BlobError, DataBlob, EncodingType};
pub use events::{EventAttributes, EventType, HistoryEvent};
pub use requests::{
    EventStoreVersion, ReplicateEventsRequest, ReplicateRawEventsRequest, ReplicationInfo,
    SyncActivityRequest, WorkflowExecution,
};
