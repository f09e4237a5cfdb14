//! Key-based shard routing with a lazily populated connection cache.
//!
//! Restaurant ids map to shards through the jump consistent hash. Each shard
//! has one cache cell; the first caller for a shard opens and pings the
//! connection while concurrent callers for the same shard wait on that same
//! attempt. Failed attempts leave the cell empty.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use shardctl_core::hash::jump_hash;
use shardctl_core::{Error, Result, ShardConnection, ShardConnector, ShardInfo};

use crate::connector::PgConnector;
use crate::pool::PoolConfig;

type ConnectionCell = Arc<OnceCell<Arc<dyn ShardConnection>>>;

fn empty_cells(n: usize) -> Vec<ConnectionCell> {
    (0..n).map(|_| Arc::new(OnceCell::new())).collect()
}

/// Routes restaurant ids to shards and caches one connection per shard.
pub struct ShardRouter {
    shards: Vec<ShardInfo>,
    connector: Arc<dyn ShardConnector>,
    cells: RwLock<Vec<ConnectionCell>>,
}

impl ShardRouter {
    /// Create a router over an ordered shard list.
    pub fn new(shards: Vec<ShardInfo>, connector: Arc<dyn ShardConnector>) -> Result<Self> {
        if shards.is_empty() {
            return Err(Error::InvalidInput(
                "at least one shard is required".to_string(),
            ));
        }
        info!(
            subsystem = "router",
            op = "init",
            num_shards = shards.len(),
            "Shard router initialized"
        );
        let cells = RwLock::new(empty_cells(shards.len()));
        Ok(Self {
            shards,
            connector,
            cells,
        })
    }

    /// Router backed by PostgreSQL pools.
    pub fn postgres(shards: Vec<ShardInfo>, pool_config: PoolConfig) -> Result<Self> {
        Self::new(shards, Arc::new(PgConnector::new(pool_config)))
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Shard number (position in the shard list) for a restaurant id.
    pub fn shard_number(&self, restaurant_id: &str) -> usize {
        jump_hash(restaurant_id, self.shards.len())
    }

    /// Shard owning a restaurant id.
    pub fn get_shard(&self, restaurant_id: &str) -> &ShardInfo {
        &self.shards[self.shard_number(restaurant_id)]
    }

    /// Shard at a shard number.
    pub fn shard(&self, number: usize) -> Option<&ShardInfo> {
        self.shards.get(number)
    }

    /// DSN of the shard owning a restaurant id.
    pub fn dsn(&self, restaurant_id: &str) -> String {
        self.get_shard(restaurant_id).dsn()
    }

    /// All shards in shard-number order.
    pub fn all_shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    /// Cached connection to the shard owning a restaurant id.
    pub async fn get_connection(&self, restaurant_id: &str) -> Result<Arc<dyn ShardConnection>> {
        let number = self.shard_number(restaurant_id);
        debug!(
            subsystem = "router",
            op = "route",
            shard_number = number,
            "Routed restaurant to shard"
        );
        self.connection_for_shard(number).await
    }

    /// Cached connection to a shard by shard number.
    pub async fn connection_for_shard(&self, number: usize) -> Result<Arc<dyn ShardConnection>> {
        let shard = self
            .shards
            .get(number)
            .ok_or_else(|| Error::ShardNotFound(format!("no shard number {}", number)))?;
        let cell = self.cells.read()[number].clone();

        if let Some(conn) = cell.get() {
            debug!(
                subsystem = "router",
                component = "connection_cache",
                shard_number = number,
                "Cache hit"
            );
            return Ok(conn.clone());
        }

        let conn = cell.get_or_try_init(|| self.open(number, shard)).await?;
        Ok(conn.clone())
    }

    /// Open and ping a fresh connection, closing it if the ping fails.
    async fn open(&self, number: usize, shard: &ShardInfo) -> Result<Arc<dyn ShardConnection>> {
        let start = Instant::now();
        let conn = self
            .connector
            .connect(shard)
            .await
            .map_err(|e| Error::ShardOpen {
                shard: number,
                source: Box::new(e),
            })
            .inspect_err(|e| {
                warn!(
                    subsystem = "router",
                    op = "connect",
                    shard_number = number,
                    shard_id = shard.id,
                    error = %e,
                    "Shard connection failed"
                )
            })?;

        if let Err(e) = conn.ping().await {
            conn.close().await;
            warn!(
                subsystem = "router",
                op = "ping",
                shard_number = number,
                shard_id = shard.id,
                error = %e,
                "Shard ping failed"
            );
            return Err(Error::ShardPing {
                shard: number,
                source: Box::new(e),
            });
        }

        info!(
            subsystem = "router",
            op = "connect",
            shard_number = number,
            shard_id = shard.id,
            host = %shard.host,
            duration_ms = start.elapsed().as_millis() as u64,
            "Shard connection opened"
        );
        Ok(conn)
    }

    /// Open and ping an uncached connection to every shard.
    ///
    /// Fails on the first unreachable shard; connections opened before it
    /// are closed.
    pub async fn all_connections(&self) -> Result<Vec<Arc<dyn ShardConnection>>> {
        let mut conns: Vec<Arc<dyn ShardConnection>> = Vec::with_capacity(self.shards.len());
        for (number, shard) in self.shards.iter().enumerate() {
            match self.open(number, shard).await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    for conn in &conns {
                        conn.close().await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(conns)
    }

    /// Ping the shard owning a restaurant id through the cache.
    pub async fn health_check(&self, restaurant_id: &str) -> Result<()> {
        let number = self.shard_number(restaurant_id);
        let conn = self.connection_for_shard(number).await?;
        conn.ping().await.map_err(|e| Error::ShardPing {
            shard: number,
            source: Box::new(e),
        })
    }

    /// Open, ping and close an uncached connection to every shard.
    pub async fn health_check_all_shards(&self) -> BTreeMap<usize, Result<()>> {
        let checks = self.shards.iter().enumerate().map(|(number, shard)| async move {
            let result = match self.open(number, shard).await {
                Ok(conn) => {
                    conn.close().await;
                    Ok(())
                }
                Err(e) => Err(e),
            };
            (number, result)
        });
        join_all(checks).await.into_iter().collect()
    }

    /// Number of shards with a cached connection.
    pub fn cached_connections(&self) -> usize {
        self.cells
            .read()
            .iter()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Close every cached connection and empty the cache.
    pub async fn close(&self) {
        let old = {
            let mut cells = self.cells.write();
            std::mem::replace(&mut *cells, empty_cells(self.shards.len()))
        };
        let mut closed = 0;
        for cell in old {
            if let Some(conn) = cell.get() {
                conn.close().await;
                closed += 1;
            }
        }
        info!(
            subsystem = "router",
            op = "close",
            connections_closed = closed,
            "Shard router closed"
        );
    }
}

impl std::fmt::Debug for ShardRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardRouter")
            .field("shards", &self.shards)
            .field("cached_connections", &self.cached_connections())
            .finish()
    }
}
