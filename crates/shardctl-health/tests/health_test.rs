//! Health checker behavior against in-memory shards.

use std::sync::Arc;
use std::time::Duration;

use shardctl_core::mock::{test_shards, MemoryConnector, MemoryShard};
use shardctl_core::{HealthStatus, HealthThresholds};
use shardctl_db::ShardRouter;
use shardctl_health::{HealthChecker, HealthCheckerConfig};

fn checker(connector: &MemoryConnector, shards: i32) -> HealthChecker {
    let router = ShardRouter::new(test_shards(shards), Arc::new(connector.clone())).unwrap();
    HealthChecker::new(Arc::new(router), HealthCheckerConfig::default())
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_shards_start_unknown() {
    let checker = checker(&MemoryConnector::new(), 3);

    let all = checker.get_all_health();
    assert_eq!(all.len(), 3);
    for (id, health) in &all {
        assert_eq!(health.shard_id, *id);
        assert_eq!(health.status, HealthStatus::Unknown);
        assert_eq!(health.message, "Not checked yet");
        assert!(!health.is_checked());
    }

    let summary = checker.get_health_summary();
    assert_eq!(summary.total_shards, 3);
    assert_eq!(summary.unknown_shards, 3);
    assert_eq!(summary.average_latency, Duration::ZERO);
    assert!(summary.system_healthy);
}

#[test]
fn test_unknown_shard_id() {
    let checker = checker(&MemoryConnector::new(), 2);
    let health = checker.get_shard_health(42);
    assert_eq!(health.status, HealthStatus::Unknown);
    assert_eq!(health.message, "Shard not found");
    assert!(checker.get_metrics(42).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_latency_classification() {
    let connector = MemoryConnector::new()
        .with_shard(0, MemoryShard::new().with_ping_delay(ms(100)))
        .with_shard(1, MemoryShard::new().with_ping_delay(ms(700)))
        .with_shard(2, MemoryShard::new().with_ping_delay(ms(2500)));
    let checker = checker(&connector, 3);

    let summary = checker.check_all_shards().await;

    let healthy = checker.get_shard_health(0);
    assert_eq!(healthy.status, HealthStatus::Healthy);
    assert_eq!(healthy.response_time, ms(100));
    assert_eq!(healthy.message, "Shard is healthy");
    assert!(healthy.is_reachable);

    let degraded = checker.get_shard_health(1);
    assert_eq!(degraded.status, HealthStatus::Degraded);
    assert_eq!(degraded.message, "Response time degraded: 700ms");

    let unhealthy = checker.get_shard_health(2);
    assert_eq!(unhealthy.status, HealthStatus::Unhealthy);
    assert_eq!(unhealthy.message, "Response time too high: 2.5s");
    assert!(unhealthy.is_reachable);

    assert_eq!(summary.healthy_shards, 1);
    assert_eq!(summary.degraded_shards, 1);
    assert_eq!(summary.unhealthy_shards, 1);
    assert_eq!(summary.unknown_shards, 0);
    assert_eq!(summary.average_latency, ms(1100));
    assert!(!summary.system_healthy);
}

#[tokio::test]
async fn test_unreachable_shard_is_unhealthy() {
    let connector = MemoryConnector::new().with_unreachable(1);
    let checker = checker(&connector, 2);

    let summary = checker.check_all_shards().await;

    let health = checker.get_shard_health(1);
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert!(!health.is_reachable);
    assert!(health.is_checked());
    assert!(health.message.starts_with("Connection failed:"));
    assert!(health.message.contains("connection refused"));

    assert_eq!(summary.healthy_shards, 1);
    assert_eq!(summary.unhealthy_shards, 1);
    assert!(!summary.system_healthy);
}

#[tokio::test]
async fn test_shard_recovers_after_failed_check() {
    let shard = MemoryShard::new().with_ping_error("server closed the connection");
    let connector = MemoryConnector::new().with_shard(0, shard.clone());
    let checker = checker(&connector, 1);

    checker.check_all_shards().await;
    let failed = checker.get_shard_health(0);
    assert_eq!(failed.status, HealthStatus::Unhealthy);
    assert!(failed.message.starts_with("Connection failed:"));

    shard.clear_ping_error();
    checker.check_all_shards().await;
    assert_eq!(checker.get_shard_health(0).status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_ping_timeout_on_cached_connection() {
    let shard = MemoryShard::new();
    let connector = MemoryConnector::new().with_shard(0, shard.clone());
    let checker = checker(&connector, 1);

    checker.check_all_shards().await;
    assert_eq!(checker.get_shard_health(0).status, HealthStatus::Healthy);

    shard.set_ping_delay(Duration::from_secs(10));
    checker.check_all_shards().await;

    let health = checker.get_shard_health(0);
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.message, "Ping timed out after 5s");
    assert_eq!(health.response_time, Duration::from_secs(5));
    assert!(!health.is_reachable);
}

#[tokio::test]
async fn test_statistics_are_collected() {
    let shard = MemoryShard::new()
        .with_rows("orders", 12)
        .with_rows("payments", 3)
        .with_rows("unrelated", 50)
        .with_database_size(8_192);
    let connector = MemoryConnector::new().with_shard(0, shard);
    let checker = checker(&connector, 1);

    checker.check_all_shards().await;

    let health = checker.get_shard_health(0);
    assert_eq!(health.database_size, 8_192);
    assert_eq!(health.record_count, 15);
    assert_eq!(health.replication_lag, None);
}

#[tokio::test]
async fn test_replication_lag_degrades() {
    let shard = MemoryShard::new().with_replication_lag(Duration::from_secs(11));
    let connector = MemoryConnector::new().with_shard(0, shard);
    let checker = checker(&connector, 1);

    checker.check_all_shards().await;

    let health = checker.get_shard_health(0);
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.message, "Replication lag high: 11s");
    assert_eq!(health.replication_lag, Some(Duration::from_secs(11)));
}

#[tokio::test]
async fn test_recorded_errors_degrade_shard() {
    let checker = checker(&MemoryConnector::new(), 2);

    for i in 0..10 {
        let result: Result<(), &str> = if i % 2 == 0 { Ok(()) } else { Err("timeout") };
        checker.record_query(0, ms(3), &result);
    }
    checker.record_query(99, ms(3), &Ok::<(), ()>(()));

    checker.check_all_shards().await;

    let health = checker.get_shard_health(0);
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.message, "Error rate high: 50.00%");
    assert!((health.error_rate - 0.5).abs() < 1e-9);
    assert_eq!(checker.get_shard_health(1).status, HealthStatus::Healthy);

    let metrics = checker.get_metrics(0).unwrap();
    assert_eq!(metrics.total_queries, 10);
    assert_eq!(metrics.failed_queries, 5);

    checker.reset_metrics(0);
    assert_eq!(checker.get_metrics(0).unwrap().total_queries, 0);
    checker.check_all_shards().await;
    assert_eq!(checker.get_shard_health(0).status, HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_custom_thresholds() {
    let connector =
        MemoryConnector::new().with_shard(0, MemoryShard::new().with_ping_delay(ms(100)));
    let checker = checker(&connector, 1);

    let strict = HealthThresholds::new(ms(50), ms(1000), 0.01, Duration::from_secs(1));
    checker.set_health_thresholds(strict);
    assert_eq!(checker.thresholds(), strict);

    checker.check_all_shards().await;
    assert_eq!(checker.get_shard_health(0).status, HealthStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_start_and_stop_loop() {
    let checker = checker(&MemoryConnector::new(), 2);
    assert!(!checker.is_running());

    assert!(checker.start());
    assert!(!checker.start());
    assert!(checker.is_running());

    // The first cycle runs one interval after start.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!checker.get_shard_health(0).is_checked());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(checker.get_shard_health(0).status, HealthStatus::Healthy);
    assert_eq!(checker.get_shard_health(1).status, HealthStatus::Healthy);

    assert!(checker.stop().await);
    assert!(!checker.stop().await);
    assert!(!checker.is_running());
}

#[test]
fn test_config_from_env() {
    std::env::set_var("HEALTH_CHECK_INTERVAL_SECS", "12");
    std::env::set_var("HEALTH_PROBE_TIMEOUT_SECS", "not-a-number");
    std::env::set_var("HEALTH_MAX_CONCURRENT_PROBES", "0");
    let config = HealthCheckerConfig::from_env();
    std::env::remove_var("HEALTH_CHECK_INTERVAL_SECS");
    std::env::remove_var("HEALTH_PROBE_TIMEOUT_SECS");
    std::env::remove_var("HEALTH_MAX_CONCURRENT_PROBES");

    assert_eq!(config.check_interval, Duration::from_secs(12));
    assert_eq!(config.probe_timeout, Duration::from_secs(5));
    assert_eq!(config.max_concurrent_probes, 1);
}
