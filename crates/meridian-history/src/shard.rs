// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-shard runtime state shared by replication tasks.
//!
//! A shard owns a transfer-task-id sequencer (ids are handed out in 2²⁰-id
//! ranges per shard-range lease) and the standby clock: one wall-time
//! register per remote cluster with monotonic-max update semantics, read by
//! the timer and transfer processors to pace standby task execution.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::SHARD_RANGE_SIZE_BITS;
use crate::persistence::{TimerTask, TransferTask};

struct TaskIdRange {
    range_id: i64,
    next: i64,
    max: i64,
}

struct ShardInner {
    task_ids: TaskIdRange,
    standby_clock: HashMap<String, DateTime<Utc>>,
}

/// Per-shard shared state.
pub struct ShardContext {
    shard_id: u32,
    inner: Mutex<ShardInner>,
}

impl ShardContext {
    /// Create shard state starting at range lease `initial_range_id`.
    pub fn new(shard_id: u32, initial_range_id: i64) -> Self {
        Self {
            shard_id,
            inner: Mutex::new(ShardInner {
                task_ids: TaskIdRange {
                    range_id: initial_range_id,
                    next: initial_range_id << SHARD_RANGE_SIZE_BITS,
                    max: (initial_range_id + 1) << SHARD_RANGE_SIZE_BITS,
                },
                standby_clock: HashMap::new(),
            }),
        }
    }

    /// Numeric shard id.
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    fn lock(&self) -> MutexGuard<'_, ShardInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Next transfer task id. Renews the range lease when the current range
    /// is exhausted.
    pub fn next_transfer_task_id(&self) -> i64 {
        let mut inner = self.lock();
        let range = &mut inner.task_ids;
        if range.next >= range.max {
            range.range_id += 1;
            range.next = range.range_id << SHARD_RANGE_SIZE_BITS;
            range.max = (range.range_id + 1) << SHARD_RANGE_SIZE_BITS;
            debug!(
                shard_id = self.shard_id,
                range_id = range.range_id,
                "renewed transfer task id range"
            );
        }
        let id = range.next;
        range.next += 1;
        id
    }

    /// Advance the standby clock for `cluster` to `time`. Regressions are
    /// ignored.
    pub fn set_current_time(&self, cluster: &str, time: DateTime<Utc>) {
        let mut inner = self.lock();
        match inner.standby_clock.get_mut(cluster) {
            Some(current) if *current >= time => {}
            Some(current) => *current = time,
            None => {
                inner.standby_clock.insert(cluster.to_string(), time);
            }
        }
    }

    /// Read the standby clock for `cluster`, if it has ever been set.
    pub fn current_time(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.lock().standby_clock.get(cluster).copied()
    }
}

/// Receives notifications about newly replicated tasks.
///
/// The history engine implements this to wake its transfer and timer queue
/// processors; the replicator depends on nothing else of the engine.
pub trait Notifier: Send + Sync {
    /// New transfer tasks were persisted for `cluster`.
    fn notify_transfer_tasks(&self, cluster: &str, tasks: &[TransferTask]);

    /// New timer tasks were persisted for `cluster`, observed at `now`.
    fn notify_timer_tasks(&self, cluster: &str, now: DateTime<Utc>, tasks: &[TimerTask]);
}

/// Notifier that drops all notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify_transfer_tasks(&self, _cluster: &str, _tasks: &[TransferTask]) {}

    fn notify_timer_tasks(&self, _cluster: &str, _now: DateTime<Utc>, _tasks: &[TimerTask]) {}
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_task_ids_monotone_across_range_renewal() {
        let shard = ShardContext::new(1, 0);
        let mut last = -1;
        for _ in 0..(1 << SHARD_RANGE_SIZE_BITS) + 10 {
            let id = shard.next_transfer_task_id();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_standby_clock_ignores_regressions() {
        let shard = ShardContext::new(1, 0);
        let t1 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 1, 1, 12, 5, 0).unwrap();

        shard.set_current_time("dc-west", t2);
        shard.set_current_time("dc-west", t1);
        assert_eq!(shard.current_time("dc-west"), Some(t2));
        assert_eq!(shard.current_time("dc-east"), None);
    }
}
