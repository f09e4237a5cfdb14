//! Core traits for shard access.
//!
//! The router, migration and health checker only talk to shards through
//! these traits, so the PostgreSQL backend and the in-memory test double are
//! interchangeable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::ShardInfo;
use crate::value::{ColumnMeta, ConflictPolicy, RowBatch, SqlValue};

/// An open connection (pool) to one shard.
#[async_trait]
pub trait ShardConnection: Send + Sync {
    /// Round-trip a trivial query.
    async fn ping(&self) -> Result<()>;

    /// `SELECT COUNT(*)` on a table.
    async fn count_rows(&self, table: &str) -> Result<i64>;

    /// Up to `limit` rows ordered by `id`, skipping `offset` rows.
    async fn fetch_batch(&self, table: &str, limit: i64, offset: i64) -> Result<RowBatch>;

    /// Insert one row; returns the number of rows written (0 on a skipped conflict).
    async fn insert_row(
        &self,
        table: &str,
        columns: &[ColumnMeta],
        values: &[SqlValue],
        conflict: ConflictPolicy,
    ) -> Result<u64>;

    /// Delete every row of a table; returns rows deleted.
    async fn delete_all(&self, table: &str) -> Result<u64>;

    /// Size of the shard database in bytes.
    async fn database_size(&self) -> Result<i64>;

    /// Replication lag when this shard is a replica, `None` on a primary.
    async fn replication_lag(&self) -> Result<Option<Duration>>;

    /// Release the underlying connections.
    async fn close(&self);
}

/// Opens connections to shards.
#[async_trait]
pub trait ShardConnector: Send + Sync {
    async fn connect(&self, shard: &ShardInfo) -> Result<Arc<dyn ShardConnection>>;
}
