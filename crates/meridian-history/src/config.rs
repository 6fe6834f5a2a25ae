// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Number of bits in a shard's transfer-task-id range. Each shard-range lease
/// grants 2^20 ids.
pub const SHARD_RANGE_SIZE_BITS: u32 = 20;

/// History-replication configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Initial capacity of the per-shard execution cache.
    pub history_cache_initial_size: usize,
    /// Maximum entries in the per-shard execution cache.
    pub history_cache_max_size: usize,
    /// Idle time after which an unpinned cache entry may be evicted.
    pub history_cache_ttl: Duration,
    /// Initial capacity of the per-shard events cache.
    pub events_cache_initial_size: usize,
    /// Maximum entries in the per-shard events cache.
    pub events_cache_max_size: usize,
    /// Idle time after which an events-cache entry may be evicted.
    pub events_cache_ttl: Duration,
    /// How often shard ownership is re-acquired.
    pub acquire_shard_interval: Duration,
    /// Artificial lag subtracted from standby task visibility times.
    pub standby_cluster_delay: Duration,
    /// Retries the replication worker performs before forcing buffered apply.
    pub replicator_buffer_retry_count: u32,
    /// Maximum delivery attempts for one replication task.
    pub replication_task_max_retry_count: u32,
    /// Accept cross-datacenter-migration traffic from a cluster this domain
    /// is not configured for.
    pub enable_dc_migration: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            history_cache_initial_size: 128,
            history_cache_max_size: 512,
            history_cache_ttl: Duration::from_secs(3600),
            events_cache_initial_size: 128,
            events_cache_max_size: 512,
            events_cache_ttl: Duration::from_secs(3600),
            acquire_shard_interval: Duration::from_secs(60),
            standby_cluster_delay: Duration::from_secs(5 * 60),
            replicator_buffer_retry_count: 8,
            replication_task_max_retry_count: 50,
            enable_dc_migration: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional; unset variables fall back to defaults:
    ///
    /// - `MERIDIAN_HISTORY_CACHE_INITIAL_SIZE` (default: 128)
    /// - `MERIDIAN_HISTORY_CACHE_MAX_SIZE` (default: 512)
    /// - `MERIDIAN_HISTORY_CACHE_TTL_SECONDS` (default: 3600)
    /// - `MERIDIAN_EVENTS_CACHE_INITIAL_SIZE` (default: 128)
    /// - `MERIDIAN_EVENTS_CACHE_MAX_SIZE` (default: 512)
    /// - `MERIDIAN_EVENTS_CACHE_TTL_SECONDS` (default: 3600)
    /// - `MERIDIAN_ACQUIRE_SHARD_INTERVAL_SECONDS` (default: 60)
    /// - `MERIDIAN_STANDBY_CLUSTER_DELAY_SECONDS` (default: 300)
    /// - `MERIDIAN_REPLICATOR_BUFFER_RETRY_COUNT` (default: 8)
    /// - `MERIDIAN_REPLICATION_TASK_MAX_RETRY_COUNT` (default: 50)
    /// - `MERIDIAN_ENABLE_DC_MIGRATION` (default: false)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            history_cache_initial_size: read_var(
                "MERIDIAN_HISTORY_CACHE_INITIAL_SIZE",
                defaults.history_cache_initial_size,
            )?,
            history_cache_max_size: read_var(
                "MERIDIAN_HISTORY_CACHE_MAX_SIZE",
                defaults.history_cache_max_size,
            )?,
            history_cache_ttl: read_secs("MERIDIAN_HISTORY_CACHE_TTL_SECONDS", defaults.history_cache_ttl)?,
            events_cache_initial_size: read_var(
                "MERIDIAN_EVENTS_CACHE_INITIAL_SIZE",
                defaults.events_cache_initial_size,
            )?,
            events_cache_max_size: read_var(
                "MERIDIAN_EVENTS_CACHE_MAX_SIZE",
                defaults.events_cache_max_size,
            )?,
            events_cache_ttl: read_secs("MERIDIAN_EVENTS_CACHE_TTL_SECONDS", defaults.events_cache_ttl)?,
            acquire_shard_interval: read_secs(
                "MERIDIAN_ACQUIRE_SHARD_INTERVAL_SECONDS",
                defaults.acquire_shard_interval,
            )?,
            standby_cluster_delay: read_secs(
                "MERIDIAN_STANDBY_CLUSTER_DELAY_SECONDS",
                defaults.standby_cluster_delay,
            )?,
            replicator_buffer_retry_count: read_var(
                "MERIDIAN_REPLICATOR_BUFFER_RETRY_COUNT",
                defaults.replicator_buffer_retry_count,
            )?,
            replication_task_max_retry_count: read_var(
                "MERIDIAN_REPLICATION_TASK_MAX_RETRY_COUNT",
                defaults.replication_task_max_retry_count,
            )?,
            enable_dc_migration: read_var(
                "MERIDIAN_ENABLE_DC_MIGRATION",
                defaults.enable_dc_migration,
            )?,
        })
    }
}

fn read_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "failed to parse value")),
        Err(_) => Ok(default),
    }
}

fn read_secs(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    let secs: u64 = read_var(name, default.as_secs())?;
    Ok(Duration::from_secs(secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
