//! Live migration of all restaurant tables from one shard to another.
//!
//! A run moves through `Pending -> Initializing -> InProgress ->
//! [Verifying] -> Cutover -> Completed`. Any failure ends in `RolledBack`,
//! purging the target first when `rollback_on_error` is set. Cancellation is
//! observed between batches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shardctl_core::defaults::{rollback_tables, MIGRATION_TABLES};
use shardctl_core::{
    ConflictPolicy, Error, MigrationConfig, MigrationProgress, MigrationState, Result, RowBatch,
    ShardConnection,
};

use crate::dual_write::{DualWriteConfig, DualWriteCoordinator};
use crate::progress::ProgressTracker;

/// Clears the active flag and the running signal when a run exits.
struct RunGuard<'a> {
    active: &'a AtomicBool,
    running: &'a watch::Sender<bool>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.send_replace(false);
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Copies data from a source shard to a target shard while dual writes keep
/// both in step.
pub struct ShardMigration {
    config: MigrationConfig,
    dual_write_config: DualWriteConfig,
    source: Arc<dyn ShardConnection>,
    target: Arc<dyn ShardConnection>,
    progress: ProgressTracker,
    active: AtomicBool,
    cancel: watch::Sender<bool>,
    running: watch::Sender<bool>,
    dual_writer: RwLock<Option<Arc<DualWriteCoordinator>>>,
}

impl ShardMigration {
    /// Create a migration in the Pending state.
    pub fn new(
        config: MigrationConfig,
        source: Arc<dyn ShardConnection>,
        target: Arc<dyn ShardConnection>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            dual_write_config: DualWriteConfig::default(),
            source,
            target,
            progress: ProgressTracker::new(),
            active: AtomicBool::new(false),
            cancel: watch::Sender::new(false),
            running: watch::Sender::new(false),
            dual_writer: RwLock::new(None),
        })
    }

    /// Use a non-default follower queue for dual writes.
    pub fn with_dual_write_config(mut self, config: DualWriteConfig) -> Self {
        self.dual_write_config = config;
        self
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn state(&self) -> MigrationState {
        self.progress.state()
    }

    /// States entered so far, in order.
    pub fn state_history(&self) -> Vec<MigrationState> {
        self.progress.history()
    }

    /// Snapshot of progress; elapsed time is computed at each call.
    pub fn progress(&self) -> MigrationProgress {
        self.progress.snapshot()
    }

    /// Whether a run is executing.
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// The dual-write coordinator, once initialization built it.
    pub fn dual_writer(&self) -> Option<Arc<DualWriteCoordinator>> {
        self.dual_writer.read().clone()
    }

    /// Run the migration to completion.
    ///
    /// Only a Pending migration can start; a second call while one is
    /// running fails with [`Error::MigrationActive`]. The whole run is
    /// bounded by `config.timeout`.
    pub async fn start(&self) -> Result<()> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::MigrationActive);
        }
        let _guard = RunGuard {
            active: &self.active,
            running: &self.running,
        };

        let state = self.progress.state();
        if state != MigrationState::Pending {
            return Err(Error::InvalidTransition {
                from: state,
                to: MigrationState::Initializing,
            });
        }
        self.running.send_replace(true);
        self.progress.begin();

        let start = Instant::now();
        info!(
            subsystem = "migration",
            op = "start",
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            batch_size = self.config.batch_size,
            verify_all = self.config.verify_all,
            rollback_on_error = self.config.rollback_on_error,
            "Starting shard migration"
        );

        let result = match tokio::time::timeout(self.config.timeout, self.run()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "migration exceeded {}s",
                self.config.timeout.as_secs()
            ))
            .in_phase(self.progress.state())),
        };

        match result {
            Ok(()) => {
                let p = self.progress.snapshot();
                info!(
                    subsystem = "migration",
                    op = "complete",
                    source_shard = self.config.source_shard_id,
                    target_shard = self.config.target_shard_id,
                    rows_migrated = p.migrated_records,
                    rows_failed = p.failed_records,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Shard migration completed"
                );
                Ok(())
            }
            Err(e) => {
                self.handle_failure(&e).await;
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<()> {
        self.advance(MigrationState::Initializing)?;
        self.initialize()
            .await
            .map_err(|e| e.in_phase(MigrationState::Initializing))?;

        self.advance(MigrationState::InProgress)?;
        self.migrate_data()
            .await
            .map_err(|e| e.in_phase(MigrationState::InProgress))?;

        if self.config.verify_all {
            self.advance(MigrationState::Verifying)?;
            self.verify_data()
                .await
                .map_err(|e| e.in_phase(MigrationState::Verifying))?;
        }

        self.advance(MigrationState::Cutover)?;
        info!(
            subsystem = "migration",
            op = "cutover",
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            "Target shard ready, routing may be switched"
        );
        self.advance(MigrationState::Completed)
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Transition unless cancelled; failures carry the current phase.
    fn advance(&self, next: MigrationState) -> Result<()> {
        let current = self.progress.state();
        self.checkpoint().map_err(|e| e.in_phase(current))?;
        self.progress.transition(next).map_err(|e| {
            if self.cancelled() {
                Error::Cancelled.in_phase(current)
            } else {
                e
            }
        })
    }

    /// Check both shards, start dual writes and count the source.
    async fn initialize(&self) -> Result<()> {
        if let Err(e) = self.source.ping().await {
            error!(
                subsystem = "migration",
                source_shard = self.config.source_shard_id,
                error = %e,
                "Source shard unreachable"
            );
            return Err(e);
        }
        if let Err(e) = self.target.ping().await {
            error!(
                subsystem = "migration",
                target_shard = self.config.target_shard_id,
                error = %e,
                "Target shard unreachable"
            );
            return Err(e);
        }

        let coordinator = DualWriteCoordinator::for_migration(
            &self.config,
            self.source.clone(),
            self.target.clone(),
            self.dual_write_config.clone(),
        );
        *self.dual_writer.write() = Some(Arc::new(coordinator));

        let mut total = 0;
        for table in MIGRATION_TABLES {
            total += self.source.count_rows(table).await?;
        }
        self.progress.set_totals(total, self.config.batch_size);

        let p = self.progress.snapshot();
        info!(
            subsystem = "migration",
            op = "count",
            total_records = p.total_records,
            estimated_seconds = p.estimated_seconds,
            "Counted source records"
        );
        Ok(())
    }

    async fn migrate_data(&self) -> Result<()> {
        for table in MIGRATION_TABLES {
            self.progress.set_table(Some(table));
            let migrated = self.migrate_table(table).await?;
            let p = self.progress.snapshot();
            info!(
                subsystem = "migration",
                op = "copy_table",
                db_table = table,
                rows_migrated = migrated,
                percent_complete = p.percent_complete,
                "Table copied"
            );
        }
        Ok(())
    }

    /// Copy one table in `id` order, `batch_size` rows at a time.
    ///
    /// Rows that fail to decode or insert are counted and skipped. Returns
    /// the rows written.
    pub(crate) async fn migrate_table(&self, table: &str) -> Result<i64> {
        let batch_size = i64::try_from(self.config.batch_size).map_err(|_| {
            Error::InvalidInput(format!("batch_size {} is too large", self.config.batch_size))
        })?;
        let mut offset = 0i64;
        let mut migrated = 0i64;

        loop {
            self.checkpoint()?;

            let RowBatch { columns, rows } =
                self.source.fetch_batch(table, batch_size, offset).await?;
            let fetched = rows.len() as i64;
            if fetched == 0 {
                break;
            }

            let mut ok = 0i64;
            let mut failed = 0i64;
            for (i, row) in rows.into_iter().enumerate() {
                let row = match row {
                    Ok(row) => row,
                    Err(e) => {
                        failed += 1;
                        warn!(
                            subsystem = "migration",
                            op = "scan",
                            db_table = table,
                            row_offset = offset + i as i64,
                            error = %e,
                            "Skipping unreadable row"
                        );
                        continue;
                    }
                };
                match self
                    .target
                    .insert_row(table, &columns, &row.values, ConflictPolicy::DoNothing)
                    .await
                {
                    Ok(_) => ok += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(
                            subsystem = "migration",
                            op = "insert",
                            db_table = table,
                            row_offset = offset + i as i64,
                            error = %e,
                            "Skipping row that failed to insert"
                        );
                    }
                }
            }

            self.progress.add_batch(ok, failed);
            migrated += ok;
            offset += fetched;
            debug!(
                subsystem = "migration",
                op = "copy_batch",
                db_table = table,
                rows_fetched = fetched,
                rows_migrated = ok,
                rows_failed = failed,
                offset,
                "Batch copied"
            );

            if fetched < batch_size {
                break;
            }
        }
        Ok(migrated)
    }

    /// Compare per-table row counts between source and target.
    ///
    /// Fails on the first table whose counts differ. Safe to call again
    /// after a completed migration. Returns the rows verified.
    pub async fn verify_data(&self) -> Result<i64> {
        self.progress.reset_verified();
        let mut verified = 0;
        for table in MIGRATION_TABLES {
            self.progress.set_table(Some(table));
            let source_count = self.source.count_rows(table).await?;
            let target_count = self.target.count_rows(table).await?;
            if source_count != target_count {
                error!(
                    subsystem = "migration",
                    op = "verify",
                    db_table = table,
                    source_count,
                    target_count,
                    "Verification mismatch"
                );
                return Err(Error::VerificationMismatch {
                    table: table.to_string(),
                    source_count,
                    target_count,
                });
            }
            self.progress.add_verified(source_count);
            verified += source_count;
            debug!(
                subsystem = "migration",
                op = "verify",
                db_table = table,
                records = source_count,
                "Table verified"
            );
        }
        self.progress.set_table(None);
        Ok(verified)
    }

    async fn handle_failure(&self, err: &Error) {
        if err.is_cancelled() {
            info!(
                subsystem = "migration",
                op = "cancel",
                source_shard = self.config.source_shard_id,
                target_shard = self.config.target_shard_id,
                "Migration run stopped after cancellation"
            );
            self.stop_dual_writer().await;
            return;
        }

        error!(
            subsystem = "migration",
            op = "fail",
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            error = %err,
            "Shard migration failed"
        );
        if self.config.rollback_on_error {
            self.purge_target().await;
        }
        self.stop_dual_writer().await;
        if let Err(e) = self.progress.mark_rolled_back() {
            warn!(subsystem = "migration", error = %e, "Could not mark migration rolled back");
        }
    }

    /// Delete all rows from the target tables, children first.
    ///
    /// Best-effort: a table that cannot be purged is logged and skipped.
    async fn purge_target(&self) {
        for table in rollback_tables() {
            match self.target.delete_all(table).await {
                Ok(deleted) => info!(
                    subsystem = "migration",
                    op = "purge",
                    target_shard = self.config.target_shard_id,
                    db_table = table,
                    rows_deleted = deleted,
                    "Purged target table"
                ),
                Err(e) => warn!(
                    subsystem = "migration",
                    op = "purge",
                    target_shard = self.config.target_shard_id,
                    db_table = table,
                    error = %e,
                    "Failed to purge target table"
                ),
            }
        }
    }

    async fn stop_dual_writer(&self) {
        let coordinator = self.dual_writer.write().take();
        if let Some(coordinator) = coordinator {
            coordinator.shutdown().await;
        }
    }

    async fn wait_until_stopped(&self) {
        let mut running = self.running.subscribe();
        let _ = running.wait_for(|running| !*running).await;
    }

    fn reject_if_completed(&self) -> Result<()> {
        let state = self.progress.state();
        if state == MigrationState::Completed {
            return Err(Error::InvalidTransition {
                from: state,
                to: MigrationState::RolledBack,
            });
        }
        Ok(())
    }

    /// Stop any run, purge the target and mark the migration rolled back.
    ///
    /// A completed migration cannot be rolled back.
    pub async fn rollback(&self) -> Result<()> {
        self.reject_if_completed()?;
        warn!(
            subsystem = "migration",
            op = "rollback",
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            "Rolling back migration"
        );

        self.cancel.send_replace(true);
        self.wait_until_stopped().await;
        // The run may have finished before it saw the signal.
        self.reject_if_completed()?;

        self.purge_target().await;
        self.stop_dual_writer().await;
        self.progress.mark_rolled_back()?;
        info!(
            subsystem = "migration",
            op = "rollback",
            state = %MigrationState::RolledBack,
            "Migration rolled back"
        );
        Ok(())
    }

    /// Abort a run at the next batch boundary and mark it rolled back.
    ///
    /// With `purge`, waits for the run to exit and then purges the target as
    /// [`rollback`](Self::rollback) does. Without it, rows already copied stay.
    pub async fn cancel(&self, purge: bool) -> Result<()> {
        self.reject_if_completed()?;
        self.cancel.send_replace(true);
        self.progress.mark_rolled_back()?;
        info!(
            subsystem = "migration",
            op = "cancel",
            source_shard = self.config.source_shard_id,
            target_shard = self.config.target_shard_id,
            purge,
            "Migration cancelled"
        );

        if purge {
            self.wait_until_stopped().await;
            self.purge_target().await;
        }
        if !self.is_running() {
            self.stop_dual_writer().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ShardMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMigration")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardctl_core::mock::MemoryShard;

    fn migration(source: &MemoryShard, target: &MemoryShard, batch: usize) -> ShardMigration {
        ShardMigration::new(
            MigrationConfig::new(0, 4).with_batch_size(batch),
            Arc::new(source.clone()),
            Arc::new(target.clone()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_migrate_table_pages_until_short_batch() {
        let source = MemoryShard::new().with_rows("orders", 250);
        let target = MemoryShard::new();
        let m = migration(&source, &target, 100);

        let migrated = m.migrate_table("orders").await.unwrap();
        assert_eq!(migrated, 250);
        assert_eq!(source.fetch_calls("orders"), 3);
        assert_eq!(target.row_ids("orders"), (1..=250).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_migrate_table_exact_multiple_reads_empty_batch() {
        let source = MemoryShard::new().with_rows("orders", 200);
        let target = MemoryShard::new();
        let m = migration(&source, &target, 100);

        assert_eq!(m.migrate_table("orders").await.unwrap(), 200);
        assert_eq!(source.fetch_calls("orders"), 3);
    }

    #[tokio::test]
    async fn test_migrate_table_offset_advances_past_failed_rows() {
        let source = MemoryShard::new()
            .with_rows("orders", 10)
            .with_unreadable_row("orders", 3);
        let target = MemoryShard::new().with_rejected_row("orders", 4);
        let m = migration(&source, &target, 5);

        let migrated = m.migrate_table("orders").await.unwrap();
        assert_eq!(migrated, 8);
        assert_eq!(m.progress().failed_records, 2);
        assert_eq!(
            target.row_ids("orders"),
            vec![1, 2, 5, 6, 7, 8, 9, 10]
        );
    }

    #[tokio::test]
    async fn test_migrate_table_empty() {
        let source = MemoryShard::new();
        let target = MemoryShard::new();
        let m = migration(&source, &target, 100);
        assert_eq!(m.migrate_table("payments").await.unwrap(), 0);
        assert_eq!(source.fetch_calls("payments"), 1);
    }

    #[tokio::test]
    async fn test_migrate_table_stops_when_cancelled() {
        let source = MemoryShard::new().with_rows("orders", 50);
        let target = MemoryShard::new();
        let m = migration(&source, &target, 10);
        m.cancel.send_replace(true);

        let err = m.migrate_table("orders").await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(source.fetch_calls("orders"), 0);
    }
}
