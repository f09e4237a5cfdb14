//! Registry of migrations started on this instance.
//!
//! Each migration runs on its own tokio task and is looked up by id for
//! status, listing and cancellation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use shardctl_core::{Error, MigrationConfig, MigrationState, Result, ShardConnection};

use crate::dual_write::DualWriteConfig;
use crate::migration::ShardMigration;

/// Point-in-time view of a registered migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub migration_id: String,
    pub source_shard_id: i32,
    pub target_shard_id: i32,
    pub state: MigrationState,
    pub progress: f64,
    pub total_records: i64,
    pub migrated: i64,
    pub verified: i64,
    pub failed: i64,
    pub elapsed_seconds: i64,
    pub message: String,
}

impl MigrationStatus {
    fn of(id: &str, migration: &ShardMigration) -> Self {
        let p = migration.progress();
        let message = match p.state {
            MigrationState::Completed => {
                format!("Migration completed in {} seconds", p.elapsed_seconds)
            }
            MigrationState::RolledBack => "Migration rolled back".to_string(),
            MigrationState::Verifying => format!(
                "Verifying data - {}/{} verified",
                p.verified_records, p.total_records
            ),
            MigrationState::Pending => "Migration queued".to_string(),
            _ => format!("Migration in progress - {:.1}% complete", p.percent_complete),
        };
        Self {
            migration_id: id.to_string(),
            source_shard_id: migration.config().source_shard_id,
            target_shard_id: migration.config().target_shard_id,
            state: p.state,
            progress: p.percent_complete,
            total_records: p.total_records,
            migrated: p.migrated_records,
            verified: p.verified_records,
            failed: p.failed_records,
            elapsed_seconds: p.elapsed_seconds,
            message,
        }
    }
}

struct Entry {
    seq: u64,
    migration: Arc<ShardMigration>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

struct Inner {
    dual_write_config: DualWriteConfig,
    migrations: RwLock<BTreeMap<String, Arc<Entry>>>,
    seq: AtomicU64,
}

/// Starts migrations in the background and keeps them addressable by id.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct MigrationRegistry {
    inner: Arc<Inner>,
}

impl Default for MigrationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::with_dual_write_config(DualWriteConfig::default())
    }

    /// Registry whose migrations use `config` for their follower queues.
    pub fn with_dual_write_config(config: DualWriteConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                dual_write_config: config,
                migrations: RwLock::new(BTreeMap::new()),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Validate `config`, spawn the migration and return its id.
    ///
    /// Fails with [`Error::MigrationActive`] while another non-terminal
    /// migration involves either shard. Must be called from within a tokio
    /// runtime.
    pub fn start(
        &self,
        config: MigrationConfig,
        source: Arc<dyn ShardConnection>,
        target: Arc<dyn ShardConnection>,
    ) -> Result<String> {
        let migration = Arc::new(
            ShardMigration::new(config.clone(), source, target)?
                .with_dual_write_config(self.inner.dual_write_config.clone()),
        );

        let mut migrations = self.inner.migrations.write();
        let busy = migrations.values().any(|e| {
            let c = e.migration.config();
            !e.migration.state().is_terminal()
                && [c.source_shard_id, c.target_shard_id]
                    .iter()
                    .any(|s| *s == config.source_shard_id || *s == config.target_shard_id)
        });
        if busy {
            return Err(Error::MigrationActive);
        }

        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let id = format!(
            "migration_{}_to_{}_{}_{}",
            config.source_shard_id,
            config.target_shard_id,
            Utc::now().timestamp(),
            seq
        );
        let task = tokio::spawn({
            let migration = migration.clone();
            let id = id.clone();
            async move {
                let result = migration.start().await;
                if let Err(e) = &result {
                    warn!(
                        subsystem = "migration",
                        op = "registry",
                        migration_id = %id,
                        error = %e,
                        "Background migration failed"
                    );
                }
                result
            }
        });
        migrations.insert(
            id.clone(),
            Arc::new(Entry {
                seq,
                migration,
                task: Mutex::new(Some(task)),
            }),
        );
        drop(migrations);

        info!(
            subsystem = "migration",
            op = "registry",
            migration_id = %id,
            source_shard = config.source_shard_id,
            target_shard = config.target_shard_id,
            "Migration started in background"
        );
        Ok(id)
    }

    fn entry(&self, id: &str) -> Result<Arc<Entry>> {
        self.inner
            .migrations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MigrationNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Arc<ShardMigration>> {
        Ok(self.entry(id)?.migration.clone())
    }

    pub fn status(&self, id: &str) -> Result<MigrationStatus> {
        let entry = self.entry(id)?;
        Ok(MigrationStatus::of(id, &entry.migration))
    }

    /// Every registered migration in the order it was started.
    pub fn list(&self) -> Vec<MigrationStatus> {
        let mut all: Vec<_> = self
            .inner
            .migrations
            .read()
            .iter()
            .map(|(id, e)| (e.seq, MigrationStatus::of(id, &e.migration)))
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, status)| status).collect()
    }

    /// Non-terminal migration touching `shard_id`, if any.
    pub fn active_for_shard(&self, shard_id: i32) -> Option<MigrationStatus> {
        self.inner.migrations.read().iter().find_map(|(id, e)| {
            let c = e.migration.config();
            let involved = c.source_shard_id == shard_id || c.target_shard_id == shard_id;
            (involved && !e.migration.state().is_terminal())
                .then(|| MigrationStatus::of(id, &e.migration))
        })
    }

    /// Cancel a migration that has not reached a terminal state.
    pub async fn cancel(&self, id: &str, purge: bool) -> Result<MigrationStatus> {
        let entry = self.entry(id)?;
        let state = entry.migration.state();
        if state.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "Cannot cancel migration that is already {}",
                state
            )));
        }
        entry.migration.cancel(purge).await?;
        Ok(MigrationStatus::of(id, &entry.migration))
    }

    /// Wait for a migration's background run and return its outcome.
    ///
    /// Only the first caller receives the outcome.
    pub async fn wait(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let task = entry.task.lock().take();
        let Some(task) = task else {
            return Err(Error::InvalidInput(format!(
                "migration {} is already being awaited",
                id
            )));
        };
        task.await
            .map_err(|e| Error::Internal(format!("migration task failed: {}", e)))?
    }

    pub fn len(&self) -> usize {
        self.inner.migrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

