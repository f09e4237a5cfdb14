//! Centralized default constants for the shardctl control plane.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates and the operator binary reference these constants instead of
//! defining their own magic numbers.

// =============================================================================
// TABLES
// =============================================================================

/// Tables copied, verified, counted and purged by the control plane, in copy
/// order. Every per-table loop iterates this constant.
pub const MIGRATION_TABLES: [&str; 5] = [
    "orders",
    "order_items",
    "payments",
    "customers",
    "restaurants",
];

/// Purge order for rollback: the exact reverse of [`MIGRATION_TABLES`].
pub fn rollback_tables() -> impl Iterator<Item = &'static str> {
    MIGRATION_TABLES.iter().rev().copied()
}

// =============================================================================
// SHARD CONNECTIONS
// =============================================================================

/// Default PostgreSQL port for a shard.
pub const SHARD_PORT: u16 = 5432;

/// Default sslmode appended to shard DSNs.
pub const SHARD_SSL_MODE: &str = "disable";

/// Maximum pooled connections per shard.
pub const POOL_MAX_CONNECTIONS: u32 = 10;

/// Minimum pooled connections kept open per shard.
pub const POOL_MIN_CONNECTIONS: u32 = 1;

/// Pool acquire timeout in seconds.
pub const POOL_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Idle connection timeout in seconds.
pub const POOL_IDLE_TIMEOUT_SECS: u64 = 600;

/// Maximum connection lifetime in seconds (30 minutes).
pub const POOL_MAX_LIFETIME_SECS: u64 = 1800;

// =============================================================================
// JUMP CONSISTENT HASH
// =============================================================================

/// LCG multiplier of the Lamping–Veach jump consistent hash.
pub const JUMP_HASH_MULTIPLIER: u64 = 2_862_933_555_777_941_757;

/// LCG increment of the Lamping–Veach jump consistent hash.
pub const JUMP_HASH_INCREMENT: u64 = 1;

// =============================================================================
// MIGRATION
// =============================================================================

/// Rows fetched per copy batch.
pub const MIGRATION_BATCH_SIZE: usize = 1000;

/// Largest accepted copy batch.
pub const MIGRATION_MAX_BATCH_SIZE: usize = 1_000_000;

/// Upper bound on a whole migration run (24 hours).
pub const MIGRATION_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Seconds added to the record-based duration estimate.
pub const MIGRATION_ESTIMATE_BUFFER_SECS: i64 = 60;

/// Interval between progress reports in the operator binary.
pub const MIGRATION_STATUS_INTERVAL_SECS: u64 = 10;

// =============================================================================
// DUAL WRITE
// =============================================================================

/// Follower writes that may wait in the dual-write queue.
pub const DUAL_WRITE_QUEUE_CAPACITY: usize = 1024;

/// Workers draining the dual-write follower queue.
pub const DUAL_WRITE_WORKERS: usize = 4;

// =============================================================================
// HEALTH
// =============================================================================

/// Interval between health check cycles.
pub const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// Per-shard probe timeout.
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;

/// Shards probed concurrently within one cycle.
pub const HEALTH_MAX_CONCURRENT_PROBES: usize = 4;

/// Ping latency above which a shard is degraded.
pub const HEALTH_DEGRADED_MS: u64 = 500;

/// Ping latency above which a shard is unhealthy.
pub const HEALTH_UNHEALTHY_MS: u64 = 2000;

/// Error rate above which a shard is degraded (0.05 = 5%).
pub const HEALTH_MAX_ERROR_RATE: f64 = 0.05;

/// Replication lag above which a shard is degraded.
pub const HEALTH_MAX_REPLICATION_LAG_SECS: u64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_tables_is_reverse_of_copy_order() {
        let rollback: Vec<&str> = rollback_tables().collect();
        assert_eq!(
            rollback,
            vec!["restaurants", "customers", "payments", "order_items", "orders"]
        );
    }

    #[test]
    fn test_health_thresholds_ordered() {
        assert!(HEALTH_DEGRADED_MS < HEALTH_UNHEALTHY_MS);
        assert!(HEALTH_UNHEALTHY_MS < HEALTH_PROBE_TIMEOUT_SECS * 1000);
    }
}
