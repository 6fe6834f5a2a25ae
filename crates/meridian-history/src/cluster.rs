// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failover-version arithmetic.
//!
//! Every history event carries a 64-bit failover version. The version encodes
//! both the authoring cluster and the failover generation: each cluster owns
//! a distinct initial version below the failover increment, and every
//! failover bumps the active version by the increment. Two versions belong to
//! the same cluster iff they agree modulo the increment; ordering across
//! clusters is plain numeric comparison.

use thiserror::Error;

/// Sentinel for "no version observed yet".
pub const EMPTY_VERSION: i64 = -1;

/// One cluster participating in replication.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Cluster name, unique within the replication group.
    pub name: String,
    /// Initial failover version. Must be unique and below the increment.
    pub initial_failover_version: i64,
}

/// Errors raised while building [`ClusterMetadata`].
#[derive(Debug, Error)]
pub enum ClusterConfigError {
    /// The failover version increment must exceed every initial version.
    #[error("failover version increment {increment} must be greater than initial version {initial} of cluster {cluster}")]
    IncrementTooSmall {
        /// Configured increment.
        increment: i64,
        /// Offending initial version.
        initial: i64,
        /// Cluster carrying the offending initial version.
        cluster: String,
    },

    /// Two clusters share an initial failover version.
    #[error("clusters {first} and {second} share initial failover version {initial}")]
    DuplicateInitialVersion {
        /// First cluster with the version.
        first: String,
        /// Second cluster with the version.
        second: String,
        /// The shared initial version.
        initial: i64,
    },

    /// The current cluster is not in the cluster list.
    #[error("current cluster {0} is not a member of the replication group")]
    UnknownCurrentCluster(String),
}

/// Static description of the replication group.
///
/// All methods are pure; failover-version arithmetic never fails once the
/// metadata is constructed.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    failover_version_increment: i64,
    current_cluster_name: String,
    clusters: Vec<ClusterInfo>,
}

impl ClusterMetadata {
    /// Build metadata for a replication group.
    pub fn new(
        failover_version_increment: i64,
        current_cluster_name: impl Into<String>,
        clusters: Vec<ClusterInfo>,
    ) -> Result<Self, ClusterConfigError> {
        let current_cluster_name = current_cluster_name.into();
        for (i, cluster) in clusters.iter().enumerate() {
            if cluster.initial_failover_version >= failover_version_increment {
                return Err(ClusterConfigError::IncrementTooSmall {
                    increment: failover_version_increment,
                    initial: cluster.initial_failover_version,
                    cluster: cluster.name.clone(),
                });
            }
            for other in &clusters[i + 1..] {
                if other.initial_failover_version == cluster.initial_failover_version {
                    return Err(ClusterConfigError::DuplicateInitialVersion {
                        first: cluster.name.clone(),
                        second: other.name.clone(),
                        initial: cluster.initial_failover_version,
                    });
                }
            }
        }
        if !clusters.iter().any(|c| c.name == current_cluster_name) {
            return Err(ClusterConfigError::UnknownCurrentCluster(
                current_cluster_name,
            ));
        }
        Ok(Self {
            failover_version_increment,
            current_cluster_name,
            clusters,
        })
    }

    /// Name of the cluster this process runs in.
    pub fn current_cluster_name(&self) -> &str {
        &self.current_cluster_name
    }

    /// All clusters in the replication group.
    pub fn clusters(&self) -> &[ClusterInfo] {
        &self.clusters
    }

    /// Name of the cluster that authored `version`.
    ///
    /// Falls back to the current cluster for versions that do not map to any
    /// member; [`EMPTY_VERSION`] maps to the current cluster as well.
    pub fn cluster_name_for_version(&self, version: i64) -> &str {
        if version == EMPTY_VERSION {
            return &self.current_cluster_name;
        }
        let initial = version.rem_euclid(self.failover_version_increment);
        self.clusters
            .iter()
            .find(|c| c.initial_failover_version == initial)
            .map(|c| c.name.as_str())
            .unwrap_or(&self.current_cluster_name)
    }

    /// Whether two versions were authored by the same cluster.
    pub fn is_version_from_same_cluster(&self, v1: i64, v2: i64) -> bool {
        (v1 - v2) % self.failover_version_increment == 0
    }

    /// The version `cluster` would author after taking over from
    /// `current_version`.
    pub fn next_failover_version(&self, cluster: &str, current_version: i64) -> i64 {
        let initial = self
            .clusters
            .iter()
            .find(|c| c.name == cluster)
            .map(|c| c.initial_failover_version)
            .unwrap_or(0);
        let generation = if current_version == EMPTY_VERSION {
            0
        } else {
            current_version / self.failover_version_increment + 1
        };
        generation * self.failover_version_increment + initial
    }
}
