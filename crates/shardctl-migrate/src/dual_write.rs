//! Dual writes to a leader and a follower shard.
//!
//! The leader insert runs on the caller's task and its result is returned.
//! The follower insert is queued on a bounded channel drained by a fixed
//! set of workers; follower failures and queue overflow are counted and
//! logged but never reach the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shardctl_core::defaults;
use shardctl_core::{
    ColumnMeta, ConflictPolicy, Error, MigrationConfig, Result, ShardConnection, SqlValue,
};

/// Configuration for the follower queue.
#[derive(Debug, Clone)]
pub struct DualWriteConfig {
    /// Follower writes that may wait in the queue before new ones are dropped.
    pub queue_capacity: usize,
    /// Workers draining the queue.
    pub workers: usize,
}

impl Default for DualWriteConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::DUAL_WRITE_QUEUE_CAPACITY,
            workers: defaults::DUAL_WRITE_WORKERS,
        }
    }
}

impl DualWriteConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `DUAL_WRITE_QUEUE_CAPACITY` | `1024` | Queued follower writes |
    /// | `DUAL_WRITE_WORKERS` | `4` | Follower workers |
    pub fn from_env() -> Self {
        let queue_capacity = std::env::var("DUAL_WRITE_QUEUE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::DUAL_WRITE_QUEUE_CAPACITY)
            .max(1);

        let workers = std::env::var("DUAL_WRITE_WORKERS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::DUAL_WRITE_WORKERS)
            .max(1);

        Self {
            queue_capacity,
            workers,
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }
}

/// Dual-write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualWriteStats {
    pub leader_writes: u64,
    pub leader_errors: u64,
    pub follower_writes: u64,
    pub follower_errors: u64,
    /// Follower writes discarded because the queue was full or closed.
    pub follower_dropped: u64,
}

impl DualWriteStats {
    /// Follower writes that did not land (failed or dropped).
    pub fn follower_lost(&self) -> u64 {
        self.follower_errors + self.follower_dropped
    }
}

#[derive(Debug, Default)]
struct Counters {
    leader_writes: AtomicU64,
    leader_errors: AtomicU64,
    follower_writes: AtomicU64,
    follower_errors: AtomicU64,
    follower_dropped: AtomicU64,
}

#[derive(Debug)]
struct FollowerWrite {
    table: String,
    columns: Vec<ColumnMeta>,
    values: Vec<SqlValue>,
}

/// Writes every row to the leader synchronously and to the follower in the
/// background.
pub struct DualWriteCoordinator {
    leader_shard: i32,
    leader: Arc<dyn ShardConnection>,
    queue: Mutex<Option<mpsc::Sender<FollowerWrite>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl DualWriteCoordinator {
    /// Create a coordinator and spawn its follower workers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        leader_shard: i32,
        leader: Arc<dyn ShardConnection>,
        follower: Arc<dyn ShardConnection>,
        config: DualWriteConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(follower_worker(
                    worker,
                    rx.clone(),
                    follower.clone(),
                    counters.clone(),
                ))
            })
            .collect();

        info!(
            subsystem = "dual_write",
            op = "init",
            leader_shard,
            queue_capacity = config.queue_capacity,
            workers = config.workers,
            "Dual-write coordinator started"
        );

        Self {
            leader_shard,
            leader,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            counters,
        }
    }

    /// Coordinator for a migration: the target leads only when it is the
    /// configured dual-write leader, otherwise the source leads.
    pub fn for_migration(
        config: &MigrationConfig,
        source: Arc<dyn ShardConnection>,
        target: Arc<dyn ShardConnection>,
        dual_write_config: DualWriteConfig,
    ) -> Self {
        if config.target_leads() {
            Self::new(config.target_shard_id, target, source, dual_write_config)
        } else {
            Self::new(config.source_shard_id, source, target, dual_write_config)
        }
    }

    /// Id of the leading shard.
    pub fn leader_shard(&self) -> i32 {
        self.leader_shard
    }

    /// Insert a row on the leader, then queue it for the follower.
    ///
    /// Returns the leader's result only.
    pub async fn write_data(
        &self,
        table: &str,
        columns: &[String],
        values: Vec<SqlValue>,
    ) -> Result<()> {
        if columns.len() != values.len() {
            return Err(Error::InvalidInput(format!(
                "write to {}: {} columns but {} values",
                table,
                columns.len(),
                values.len()
            )));
        }
        let columns: Vec<ColumnMeta> = columns.iter().map(ColumnMeta::new).collect();

        if let Err(e) = self
            .leader
            .insert_row(table, &columns, &values, ConflictPolicy::Error)
            .await
        {
            self.counters.leader_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                subsystem = "dual_write",
                op = "leader_write",
                leader_shard = self.leader_shard,
                db_table = table,
                error = %e,
                "Leader write failed"
            );
            return Err(e);
        }
        self.counters.leader_writes.fetch_add(1, Ordering::Relaxed);

        let write = FollowerWrite {
            table: table.to_string(),
            columns,
            values,
        };
        let sender = self.queue.lock().clone();
        let dropped = match sender {
            Some(tx) => match tx.try_send(write) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some("queue full"),
                Err(TrySendError::Closed(_)) => Some("queue closed"),
            },
            None => Some("coordinator shut down"),
        };
        if let Some(reason) = dropped {
            self.counters.follower_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                subsystem = "dual_write",
                op = "enqueue",
                leader_shard = self.leader_shard,
                db_table = table,
                reason,
                "Follower write dropped"
            );
        }
        Ok(())
    }

    pub fn stats(&self) -> DualWriteStats {
        DualWriteStats {
            leader_writes: self.counters.leader_writes.load(Ordering::Relaxed),
            leader_errors: self.counters.leader_errors.load(Ordering::Relaxed),
            follower_writes: self.counters.follower_writes.load(Ordering::Relaxed),
            follower_errors: self.counters.follower_errors.load(Ordering::Relaxed),
            follower_dropped: self.counters.follower_dropped.load(Ordering::Relaxed),
        }
    }

    /// Close the queue and wait for queued follower writes to finish.
    ///
    /// Later calls to [`write_data`](Self::write_data) still write the
    /// leader but drop the follower write.
    pub async fn shutdown(&self) {
        drop(self.queue.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(subsystem = "dual_write", error = %e, "Follower worker panicked");
            }
        }
        let stats = self.stats();
        info!(
            subsystem = "dual_write",
            op = "shutdown",
            leader_shard = self.leader_shard,
            leader_writes = stats.leader_writes,
            follower_writes = stats.follower_writes,
            follower_errors = stats.follower_errors,
            follower_dropped = stats.follower_dropped,
            "Dual-write coordinator stopped"
        );
    }
}

impl std::fmt::Debug for DualWriteCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualWriteCoordinator")
            .field("leader_shard", &self.leader_shard)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn follower_worker(
    worker: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<FollowerWrite>>>,
    follower: Arc<dyn ShardConnection>,
    counters: Arc<Counters>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(write) = next else {
            break;
        };
        // The copy may already have written this row.
        match follower
            .insert_row(
                &write.table,
                &write.columns,
                &write.values,
                ConflictPolicy::DoNothing,
            )
            .await
        {
            Ok(_) => {
                counters.follower_writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.follower_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subsystem = "dual_write",
                    op = "follower_write",
                    worker,
                    db_table = %write.table,
                    error = %e,
                    "Follower write failed"
                );
            }
        }
    }
    debug!(subsystem = "dual_write", worker, "Follower worker stopped");
}
