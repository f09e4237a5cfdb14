//! Migration state and counters behind a short-held lock.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::info;

use shardctl_core::defaults;
use shardctl_core::{Error, MigrationProgress, MigrationState, Result};

#[derive(Debug)]
struct Tracked {
    progress: MigrationProgress,
    finished_at: Option<DateTime<Utc>>,
    history: Vec<MigrationState>,
}

/// Owns a migration's [`MigrationProgress`].
///
/// Every method takes the lock briefly and never across an await, so
/// readers are never blocked behind a running phase.
#[derive(Debug)]
pub struct ProgressTracker {
    inner: RwLock<Tracked>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tracked {
                progress: MigrationProgress::new(),
                finished_at: None,
                history: vec![MigrationState::Pending],
            }),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.inner.read().progress.state
    }

    /// Reset the clock at the start of a run.
    pub fn begin(&self) {
        let mut inner = self.inner.write();
        inner.progress.start_time = Utc::now();
        inner.finished_at = None;
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&self, next: MigrationState) -> Result<()> {
        let mut inner = self.inner.write();
        let from = inner.progress.state;
        if !from.can_transition_to(next) {
            return Err(Error::InvalidTransition { from, to: next });
        }
        inner.progress.state = next;
        inner.history.push(next);
        if next.is_terminal() {
            inner.finished_at = Some(Utc::now());
            inner.progress.current_table = None;
        }
        drop(inner);

        info!(
            subsystem = "migration",
            op = "transition",
            from = %from,
            state = %next,
            "Migration state changed"
        );
        Ok(())
    }

    /// Move to RolledBack. Already RolledBack is fine; Completed is an
    /// [`Error::InvalidTransition`].
    pub fn mark_rolled_back(&self) -> Result<()> {
        match self.transition(MigrationState::RolledBack) {
            Ok(()) => Ok(()),
            Err(_) if self.state() == MigrationState::RolledBack => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Every state entered so far, starting with Pending.
    pub fn history(&self) -> Vec<MigrationState> {
        self.inner.read().history.clone()
    }

    pub fn set_table(&self, table: Option<&str>) {
        self.inner.write().progress.current_table = table.map(str::to_string);
    }

    /// Record the source row total and derive the duration estimate.
    pub fn set_totals(&self, total_records: i64, batch_size: usize) {
        let mut inner = self.inner.write();
        let p = &mut inner.progress;
        p.total_records = total_records;
        p.estimated_seconds =
            total_records / batch_size.max(1) as i64 + defaults::MIGRATION_ESTIMATE_BUFFER_SECS;
        p.estimated_end_time = Some(p.start_time + ChronoDuration::seconds(p.estimated_seconds));
    }

    /// Count one copied batch.
    pub fn add_batch(&self, migrated: i64, failed: i64) {
        let mut inner = self.inner.write();
        inner.progress.migrated_records += migrated;
        inner.progress.failed_records += failed;
    }

    pub fn add_verified(&self, verified: i64) {
        self.inner.write().progress.verified_records += verified;
    }

    pub fn reset_verified(&self) {
        self.inner.write().progress.verified_records = 0;
    }

    /// Copy of the progress with elapsed time and percentage filled in.
    ///
    /// Elapsed time stops advancing once the migration is terminal.
    pub fn snapshot(&self) -> MigrationProgress {
        let inner = self.inner.read();
        let mut p = inner.progress.clone();
        let until = inner.finished_at.unwrap_or_else(Utc::now);
        drop(inner);

        p.elapsed_seconds = (until - p.start_time).num_seconds().max(0);
        p.percent_complete = if p.total_records > 0 {
            (p.migrated_records as f64 / p.total_records as f64 * 100.0).min(100.0)
        } else if p.state == MigrationState::Completed {
            100.0
        } else {
            0.0
        };
        p
    }
}
