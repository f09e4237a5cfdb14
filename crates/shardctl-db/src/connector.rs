//! Opens PostgreSQL shard pools.

use std::sync::Arc;

use async_trait::async_trait;

use shardctl_core::{Result, ShardConnection, ShardConnector, ShardInfo};

use crate::connection::PgShardConnection;
use crate::pool::{create_pool_with_config, PoolConfig};

/// [`ShardConnector`] that opens one sqlx pool per shard.
#[derive(Debug, Clone, Default)]
pub struct PgConnector {
    pool_config: PoolConfig,
}

impl PgConnector {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self { pool_config }
    }

    pub fn pool_config(&self) -> &PoolConfig {
        &self.pool_config
    }
}

#[async_trait]
impl ShardConnector for PgConnector {
    async fn connect(&self, shard: &ShardInfo) -> Result<Arc<dyn ShardConnection>> {
        let pool = create_pool_with_config(shard.id, &shard.dsn(), &self.pool_config).await?;
        Ok(Arc::new(PgShardConnection::new(shard.id, pool)))
    }
}
