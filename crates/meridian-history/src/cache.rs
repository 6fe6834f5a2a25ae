// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-shard workflow-execution cache.
//!
//! Maps `(domain, workflow id, run id)` to the [`ExecutionContext`] owning
//! that run's mutable state and guarantees at most one concurrent holder per
//! key. Acquisition blocks on the per-key lock until it is granted or the
//! caller's cancellation token fires. Releasing with an error invalidates the
//! cached mutable state so the next holder re-reads storage.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use meridian_protocol::WorkflowExecution;

use crate::context::ExecutionContext;
use crate::error::ReplicationError;
use crate::persistence::{ExecutionStore, HistoryStore};
use crate::shard::ShardContext;

type CacheKey = (String, String, String);

struct CacheEntry {
    context: Arc<tokio::sync::Mutex<ExecutionContext>>,
    last_access: Instant,
}

/// Per-shard cache of execution contexts.
pub struct ExecutionCache {
    shard: Arc<ShardContext>,
    execution_store: Arc<dyn ExecutionStore>,
    history_store: Arc<dyn HistoryStore>,
    current_cluster: String,
    max_size: usize,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ExecutionCache {
    /// Create a cache bounded to `max_size` entries with idle TTL `ttl`.
    pub fn new(
        shard: Arc<ShardContext>,
        execution_store: Arc<dyn ExecutionStore>,
        history_store: Arc<dyn HistoryStore>,
        current_cluster: impl Into<String>,
        initial_size: usize,
        max_size: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            shard,
            execution_store,
            history_store,
            current_cluster: current_cluster.into(),
            max_size,
            ttl,
            entries: Mutex::new(HashMap::with_capacity(initial_size)),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of cached contexts.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Acquire the exclusive context for a run.
    ///
    /// With `run_id` omitted, resolves the workflow id's current run through
    /// storage first. Blocks until the per-key lock is granted; fails with
    /// [`ReplicationError::AcquireTimeout`] when `token` is cancelled while
    /// waiting.
    pub async fn acquire(
        &self,
        token: &CancellationToken,
        domain_id: &str,
        workflow_id: &str,
        run_id: Option<&str>,
    ) -> Result<AcquiredContext, ReplicationError> {
        let run_id = match run_id {
            Some(run_id) => run_id.to_string(),
            None => {
                // Resolve the current run; acquisition then pins that run's
                // context, so a pointer move between lookup and lock shows up
                // as a conditional-write failure downstream, never as a
                // wrong-run mutation.
                self.execution_store
                    .get_current_execution(domain_id, workflow_id)
                    .await
                    .map_err(ReplicationError::from)?
                    .run_id
            }
        };

        let context = self.pin_entry(domain_id, workflow_id, &run_id);

        let guard = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return Err(ReplicationError::AcquireTimeout {
                    workflow_id: workflow_id.to_string(),
                });
            }
            guard = context.lock_owned() => guard,
        };

        Ok(AcquiredContext {
            guard,
            invalidate_on_drop: true,
        })
    }

    fn pin_entry(
        &self,
        domain_id: &str,
        workflow_id: &str,
        run_id: &str,
    ) -> Arc<tokio::sync::Mutex<ExecutionContext>> {
        let key: CacheKey = (
            domain_id.to_string(),
            workflow_id.to_string(),
            run_id.to_string(),
        );
        let mut entries = self.lock_entries();
        self.evict(&mut entries);
        let entry = entries.entry(key).or_insert_with(|| CacheEntry {
            context: Arc::new(tokio::sync::Mutex::new(ExecutionContext::new(
                domain_id,
                WorkflowExecution {
                    workflow_id: workflow_id.to_string(),
                    run_id: run_id.to_string(),
                },
                Arc::clone(&self.shard),
                Arc::clone(&self.execution_store),
                Arc::clone(&self.history_store),
                self.current_cluster.clone(),
            ))),
            last_access: Instant::now(),
        });
        entry.last_access = Instant::now();
        Arc::clone(&entry.context)
    }

    /// Evict idle, unheld entries. Entries whose context is referenced
    /// outside the cache are never evicted.
    fn evict(&self, entries: &mut HashMap<CacheKey, CacheEntry>) {
        let now = Instant::now();
        let over_capacity = entries.len() >= self.max_size;
        let mut evictable: Vec<(CacheKey, Instant)> = entries
            .iter()
            .filter(|(_, entry)| Arc::strong_count(&entry.context) == 1)
            .filter(|(_, entry)| {
                over_capacity || now.duration_since(entry.last_access) >= self.ttl
            })
            .map(|(key, entry)| (key.clone(), entry.last_access))
            .collect();
        if evictable.is_empty() {
            return;
        }
        evictable.sort_by_key(|(_, last_access)| *last_access);
        let mut target = entries.len();
        for (key, _) in evictable {
            let expired = entries
                .get(&key)
                .map(|entry| now.duration_since(entry.last_access) >= self.ttl)
                .unwrap_or(false);
            if target >= self.max_size || expired {
                entries.remove(&key);
                target = target.saturating_sub(1);
                debug!(?key, "evicted idle execution context");
            }
        }
    }
}

/// Exclusive hold on an [`ExecutionContext`].
///
/// Dropping the hold without calling [`AcquiredContext::release`] with a
/// success result invalidates the cached mutable state, so early returns and
/// panics leave the cache safe rather than stale.
pub struct AcquiredContext {
    guard: OwnedMutexGuard<ExecutionContext>,
    invalidate_on_drop: bool,
}

impl AcquiredContext {
    /// Release the hold, keeping the cached state only on success.
    pub fn release<T, E>(mut self, result: &Result<T, E>) {
        if result.is_ok() {
            self.invalidate_on_drop = false;
        }
    }

    /// Release the hold, keeping the cached state.
    pub fn release_clean(mut self) {
        self.invalidate_on_drop = false;
    }
}

impl Deref for AcquiredContext {
    type Target = ExecutionContext;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for AcquiredContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for AcquiredContext {
    fn drop(&mut self) {
        if self.invalidate_on_drop {
            self.guard.clear_cached_state();
        }
    }
}
