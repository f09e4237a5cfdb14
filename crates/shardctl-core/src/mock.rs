//! In-memory shard for deterministic testing.
//!
//! Provides [`MemoryShard`], a [`ShardConnection`] that keeps tables in
//! memory, and [`MemoryConnector`], which hands out connections to a fixed set
//! of memory shards. Both carry failure knobs (unreachable shards, failing
//! pings, rows that cannot be read or written) and call counters for
//! assertions.
//!
//! ## Usage
//!
//! ```rust
//! use shardctl_core::mock::MemoryShard;
//! use shardctl_core::ShardConnection;
//!
//! # async fn demo() {
//! let shard = MemoryShard::new().with_rows("orders", 250);
//! assert_eq!(shard.count_rows("orders").await.unwrap(), 250);
//! # }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::models::ShardInfo;
use crate::traits::{ShardConnection, ShardConnector};
use crate::value::{ColumnMeta, ConflictPolicy, Row, RowBatch, SqlValue};

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<ColumnMeta>,
    rows: BTreeMap<i64, Vec<SqlValue>>,
}

#[derive(Debug, Default)]
struct ShardState {
    tables: HashMap<String, MemoryTable>,
    ping_error: Option<String>,
    ping_delay: Duration,
    fetch_delay: Duration,
    fetch_errors: HashSet<String>,
    unreadable: HashSet<(String, i64)>,
    rejected: HashSet<(String, i64)>,
    count_overrides: HashMap<String, i64>,
    failing_deletes: HashSet<String>,
    database_size: i64,
    replication_lag: Option<Duration>,
    fetch_calls: HashMap<String, usize>,
    insert_calls: usize,
    ping_calls: usize,
    close_calls: usize,
}

/// In-memory shard. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryShard {
    state: Arc<Mutex<ShardState>>,
}

fn default_columns() -> Vec<ColumnMeta> {
    vec![
        ColumnMeta::typed("id", "int8"),
        ColumnMeta::typed("name", "text"),
    ]
}

fn row_id(columns: &[ColumnMeta], values: &[SqlValue]) -> Result<i64> {
    columns
        .iter()
        .position(|c| c.name == "id")
        .and_then(|i| values.get(i))
        .and_then(SqlValue::as_i64)
        .ok_or_else(|| Error::InvalidInput("row has no integer id column".to_string()))
}

impl MemoryShard {
    /// Create an empty shard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed `table` with rows `1..=count`, columns `id` and `name`.
    pub fn with_rows(self, table: &str, count: i64) -> Self {
        {
            let mut state = self.state.lock();
            let t = state.tables.entry(table.to_string()).or_default();
            if t.columns.is_empty() {
                t.columns = default_columns();
            }
            for id in 1..=count {
                t.rows.insert(
                    id,
                    vec![SqlValue::Int(id), SqlValue::Text(format!("{}-{}", table, id))],
                );
            }
        }
        self
    }

    /// Make every ping fail with `message`.
    pub fn with_ping_error(self, message: impl Into<String>) -> Self {
        self.state.lock().ping_error = Some(message.into());
        self
    }

    /// Delay every ping.
    pub fn with_ping_delay(self, delay: Duration) -> Self {
        self.state.lock().ping_delay = delay;
        self
    }

    /// Delay every batch fetch.
    pub fn with_fetch_delay(self, delay: Duration) -> Self {
        self.state.lock().fetch_delay = delay;
        self
    }

    /// Make every fetch on `table` fail.
    pub fn with_fetch_error(self, table: &str) -> Self {
        self.state.lock().fetch_errors.insert(table.to_string());
        self
    }

    /// Row `id` of `table` fails to decode when fetched.
    pub fn with_unreadable_row(self, table: &str, id: i64) -> Self {
        self.state.lock().unreadable.insert((table.to_string(), id));
        self
    }

    /// Inserting row `id` into `table` fails.
    pub fn with_rejected_row(self, table: &str, id: i64) -> Self {
        self.state.lock().rejected.insert((table.to_string(), id));
        self
    }

    /// Report `count` for `table` regardless of its contents.
    pub fn with_count_override(self, table: &str, count: i64) -> Self {
        self.state.lock().count_overrides.insert(table.to_string(), count);
        self
    }

    /// Make `DELETE` on `table` fail.
    pub fn with_failing_delete(self, table: &str) -> Self {
        self.state.lock().failing_deletes.insert(table.to_string());
        self
    }

    pub fn with_database_size(self, bytes: i64) -> Self {
        self.state.lock().database_size = bytes;
        self
    }

    pub fn with_replication_lag(self, lag: Duration) -> Self {
        self.state.lock().replication_lag = Some(lag);
        self
    }

    /// Clear a ping error set earlier.
    pub fn clear_ping_error(&self) {
        self.state.lock().ping_error = None;
    }

    /// Set the ping delay after construction.
    pub fn set_ping_delay(&self, delay: Duration) {
        self.state.lock().ping_delay = delay;
    }

    /// Rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Ids currently stored in `table`, ascending.
    pub fn row_ids(&self, table: &str) -> Vec<i64> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Stored values of one row.
    pub fn row(&self, table: &str, id: i64) -> Option<Vec<SqlValue>> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id).cloned())
    }

    /// Number of `fetch_batch` calls on `table`.
    pub fn fetch_calls(&self, table: &str) -> usize {
        self.state
            .lock()
            .fetch_calls
            .get(table)
            .copied()
            .unwrap_or(0)
    }

    pub fn insert_calls(&self) -> usize {
        self.state.lock().insert_calls
    }

    pub fn ping_calls(&self) -> usize {
        self.state.lock().ping_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }
}

#[async_trait]
impl ShardConnection for MemoryShard {
    async fn ping(&self) -> Result<()> {
        let (delay, error) = {
            let mut state = self.state.lock();
            state.ping_calls += 1;
            (state.ping_delay, state.ping_error.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match error {
            Some(message) => Err(Error::Query(message)),
            None => Ok(()),
        }
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let state = self.state.lock();
        if let Some(count) = state.count_overrides.get(table) {
            return Ok(*count);
        }
        Ok(state.tables.get(table).map_or(0, |t| t.rows.len() as i64))
    }

    async fn fetch_batch(&self, table: &str, limit: i64, offset: i64) -> Result<RowBatch> {
        let delay = {
            let mut state = self.state.lock();
            *state.fetch_calls.entry(table.to_string()).or_insert(0) += 1;
            state.fetch_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if state.fetch_errors.contains(table) {
            return Err(Error::Query(format!("relation \"{}\" is unavailable", table)));
        }
        let Some(t) = state.tables.get(table) else {
            return Ok(RowBatch::new(default_columns(), Vec::new()));
        };

        let rows = t
            .rows
            .iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .map(|(id, values)| {
                if state.unreadable.contains(&(table.to_string(), *id)) {
                    Err(Error::UnsupportedType {
                        column: "name".to_string(),
                        type_name: "tsvector".to_string(),
                    })
                } else {
                    Ok(Row::new(values.clone()))
                }
            })
            .collect();

        Ok(RowBatch::new(t.columns.clone(), rows))
    }

    async fn insert_row(
        &self,
        table: &str,
        columns: &[ColumnMeta],
        values: &[SqlValue],
        conflict: ConflictPolicy,
    ) -> Result<u64> {
        if columns.len() != values.len() {
            return Err(Error::InvalidInput(format!(
                "insert into {}: {} columns but {} values",
                table,
                columns.len(),
                values.len()
            )));
        }
        let id = row_id(columns, values)?;

        let mut state = self.state.lock();
        state.insert_calls += 1;
        if state.rejected.contains(&(table.to_string(), id)) {
            return Err(Error::Query(format!(
                "insert into {} rejected row {}",
                table, id
            )));
        }

        let t = state.tables.entry(table.to_string()).or_default();
        if t.columns.is_empty() {
            t.columns = columns.to_vec();
        }
        if t.rows.contains_key(&id) {
            return match conflict {
                ConflictPolicy::DoNothing => Ok(0),
                ConflictPolicy::Error => Err(Error::Query(format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table
                ))),
            };
        }
        t.rows.insert(id, values.to_vec());
        Ok(1)
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        let mut state = self.state.lock();
        if state.failing_deletes.contains(table) {
            return Err(Error::Query(format!("permission denied for table {}", table)));
        }
        let deleted = state.tables.get_mut(table).map_or(0, |t| {
            let n = t.rows.len() as u64;
            t.rows.clear();
            n
        });
        Ok(deleted)
    }

    async fn database_size(&self) -> Result<i64> {
        Ok(self.state.lock().database_size)
    }

    async fn replication_lag(&self) -> Result<Option<Duration>> {
        Ok(self.state.lock().replication_lag)
    }

    async fn close(&self) {
        self.state.lock().close_calls += 1;
    }
}

#[derive(Debug, Default)]
struct ConnectorState {
    shards: HashMap<i32, MemoryShard>,
    unreachable: HashSet<i32>,
    connect_delay: Duration,
}

/// Hands out [`MemoryShard`] connections by shard id.
///
/// Unknown ids get a fresh empty shard on first connect.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
    connects: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the shard served for `id`.
    pub fn with_shard(self, id: i32, shard: MemoryShard) -> Self {
        self.state.lock().shards.insert(id, shard);
        self
    }

    /// Make connecting to `id` fail.
    pub fn with_unreachable(self, id: i32) -> Self {
        self.state.lock().unreachable.insert(id);
        self
    }

    /// Delay every connect.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.state.lock().connect_delay = delay;
        self
    }

    /// Make `id` reachable again.
    pub fn set_reachable(&self, id: i32) {
        self.state.lock().unreachable.remove(&id);
    }

    /// Make `id` unreachable.
    pub fn set_unreachable(&self, id: i32) {
        self.state.lock().unreachable.insert(id);
    }

    /// Shard served for `id`, created on demand.
    pub fn shard(&self, id: i32) -> MemoryShard {
        self.state.lock().shards.entry(id).or_default().clone()
    }

    /// Total connect attempts, including failed ones.
    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShardConnector for MemoryConnector {
    async fn connect(&self, shard: &ShardInfo) -> Result<Arc<dyn ShardConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.unreachable.contains(&shard.id) {
            return Err(Error::Query(format!(
                "connection refused ({}:{})",
                shard.host, shard.port
            )));
        }
        let memory = state.shards.entry(shard.id).or_default().clone();
        Ok(Arc::new(memory))
    }
}

/// `count` shards with ids `0..count` on hosts `shard-N`.
pub fn test_shards(count: i32) -> Vec<ShardInfo> {
    (0..count)
        .map(|id| {
            ShardInfo::new(
                id,
                format!("shard-{}", id),
                "pos",
                "secret",
                format!("restaurant_shard_{}", id),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_batch_pages_by_id() {
        let shard = MemoryShard::new().with_rows("orders", 25);
        let first = shard.fetch_batch("orders", 10, 0).await.unwrap();
        let last = shard.fetch_batch("orders", 10, 20).await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(last.len(), 5);
        let id = last.rows[0].as_ref().unwrap().values[0].as_i64();
        assert_eq!(id, Some(21));
        assert_eq!(shard.fetch_calls("orders"), 2);
    }

    #[tokio::test]
    async fn test_unreadable_row_is_per_row_error() {
        let shard = MemoryShard::new()
            .with_rows("orders", 3)
            .with_unreadable_row("orders", 2);
        let batch = shard.fetch_batch("orders", 10, 0).await.unwrap();
        assert!(batch.rows[0].is_ok());
        assert!(batch.rows[1].is_err());
        assert!(batch.rows[2].is_ok());
    }

    #[tokio::test]
    async fn test_insert_conflict_policies() {
        let shard = MemoryShard::new();
        let columns = default_columns();
        let values = vec![SqlValue::Int(1), SqlValue::from("a")];

        let n = shard
            .insert_row("orders", &columns, &values, ConflictPolicy::DoNothing)
            .await
            .unwrap();
        assert_eq!(n, 1);
        let n = shard
            .insert_row("orders", &columns, &values, ConflictPolicy::DoNothing)
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert!(shard
            .insert_row("orders", &columns, &values, ConflictPolicy::Error)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connector_unreachable() {
        let connector = MemoryConnector::new().with_unreachable(1);
        let shards = test_shards(2);
        assert!(connector.connect(&shards[0]).await.is_ok());
        assert!(connector.connect(&shards[1]).await.is_err());
        assert_eq!(connector.connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_connector_shares_shard_state() {
        let connector = MemoryConnector::new().with_shard(0, MemoryShard::new().with_rows("orders", 4));
        let conn = connector.connect(&test_shards(1)[0]).await.unwrap();
        conn.delete_all("orders").await.unwrap();
        assert_eq!(connector.shard(0).row_count("orders"), 0);
    }
}
