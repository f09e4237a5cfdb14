//! Periodic shard health checking.
//!
//! Each cycle probes every shard through the router with bounded
//! concurrency, replaces that shard's snapshot, and classifies it from ping
//! latency, recorded query error rate and replication lag.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use shardctl_core::defaults::{self, MIGRATION_TABLES};
use shardctl_core::{
    HealthStatus, HealthSummary, HealthThresholds, ShardConnection, ShardHealth, ShardInfo,
    ShardMetricsSnapshot,
};
use shardctl_db::ShardRouter;

use crate::metrics::ShardMetrics;

/// Configuration for the health check loop.
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Time between check cycles.
    pub check_interval: Duration,
    /// Deadline for one shard's ping and for its statistics queries.
    pub probe_timeout: Duration,
    /// Shards probed at the same time within a cycle.
    pub max_concurrent_probes: usize,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(defaults::HEALTH_CHECK_INTERVAL_SECS),
            probe_timeout: Duration::from_secs(defaults::HEALTH_PROBE_TIMEOUT_SECS),
            max_concurrent_probes: defaults::HEALTH_MAX_CONCURRENT_PROBES,
        }
    }
}

impl HealthCheckerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `HEALTH_CHECK_INTERVAL_SECS` | `30` | Seconds between cycles |
    /// | `HEALTH_PROBE_TIMEOUT_SECS` | `5` | Per-shard probe timeout |
    /// | `HEALTH_MAX_CONCURRENT_PROBES` | `4` | Concurrent probes per cycle |
    pub fn from_env() -> Self {
        let secs = |var: &str, default: u64| {
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };

        let max_concurrent_probes = std::env::var("HEALTH_MAX_CONCURRENT_PROBES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::HEALTH_MAX_CONCURRENT_PROBES)
            .max(1);

        Self {
            check_interval: Duration::from_secs(secs(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults::HEALTH_CHECK_INTERVAL_SECS,
            )),
            probe_timeout: Duration::from_secs(secs(
                "HEALTH_PROBE_TIMEOUT_SECS",
                defaults::HEALTH_PROBE_TIMEOUT_SECS,
            )),
            max_concurrent_probes,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_probes(mut self, n: usize) -> Self {
        self.max_concurrent_probes = n;
        self
    }
}

/// Classify a shard from one probe.
///
/// Latency is checked first, then error rate, then replication lag. Returns
/// the status and a human-readable reason.
pub fn classify(
    response_time: Duration,
    error_rate: f64,
    replication_lag: Option<Duration>,
    thresholds: &HealthThresholds,
) -> (HealthStatus, String) {
    if response_time > thresholds.unhealthy {
        return (
            HealthStatus::Unhealthy,
            format!("Response time too high: {:?}", response_time),
        );
    }
    if response_time > thresholds.degraded {
        return (
            HealthStatus::Degraded,
            format!("Response time degraded: {:?}", response_time),
        );
    }
    if error_rate > thresholds.max_error_rate {
        return (
            HealthStatus::Degraded,
            format!("Error rate high: {:.2}%", error_rate * 100.0),
        );
    }
    if let Some(lag) = replication_lag {
        if lag > thresholds.max_replication_lag {
            return (
                HealthStatus::Degraded,
                format!("Replication lag high: {:?}", lag),
            );
        }
    }
    (HealthStatus::Healthy, "Shard is healthy".to_string())
}

struct LoopHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Inner {
    router: Arc<ShardRouter>,
    config: HealthCheckerConfig,
    health: RwLock<BTreeMap<i32, ShardHealth>>,
    metrics: BTreeMap<i32, ShardMetrics>,
    thresholds: RwLock<HealthThresholds>,
    check_loop: Mutex<Option<LoopHandle>>,
}

/// Tracks the health of every shard known to a router.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct HealthChecker {
    inner: Arc<Inner>,
}

impl HealthChecker {
    /// Create a checker; every shard starts out `Unknown`.
    pub fn new(router: Arc<ShardRouter>, config: HealthCheckerConfig) -> Self {
        let shards = router.all_shards();
        let health = shards
            .iter()
            .map(|s| (s.id, ShardHealth::unknown(s.id, s.host.clone())))
            .collect();
        let metrics = shards
            .iter()
            .map(|s| (s.id, ShardMetrics::new(s.id)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                router,
                config,
                health: RwLock::new(health),
                metrics,
                thresholds: RwLock::new(HealthThresholds::default()),
                check_loop: Mutex::new(None),
            }),
        }
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.inner.router
    }

    pub fn config(&self) -> &HealthCheckerConfig {
        &self.inner.config
    }

    /// Start the periodic check loop.
    ///
    /// Returns `false` if a loop is already running. The first cycle runs
    /// one interval after start. Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut check_loop = self.inner.check_loop.lock();
        if check_loop.is_some() {
            debug!(subsystem = "health", op = "start", "Health checker already running");
            return false;
        }

        let interval = self.inner.config.check_interval;
        let (stop, mut stop_rx) = oneshot::channel();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        HealthChecker { inner }.check_all_shards().await;
                    }
                }
            }
            debug!(subsystem = "health", "Health check loop exited");
        });

        *check_loop = Some(LoopHandle { stop, task });
        info!(
            subsystem = "health",
            op = "start",
            interval_secs = interval.as_secs(),
            num_shards = self.inner.metrics.len(),
            "Health checker started"
        );
        true
    }

    /// Stop the check loop and wait for it to exit.
    ///
    /// Returns `false` if no loop was running.
    pub async fn stop(&self) -> bool {
        let handle = self.inner.check_loop.lock().take();
        let Some(LoopHandle { stop, task }) = handle else {
            return false;
        };
        let _ = stop.send(());
        if let Err(e) = task.await {
            warn!(subsystem = "health", error = %e, "Health check loop panicked");
        }
        info!(subsystem = "health", op = "stop", "Health checker stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.check_loop.lock().is_some()
    }

    /// Probe every shard once and return the new summary.
    pub async fn check_all_shards(&self) -> HealthSummary {
        let thresholds = self.thresholds();
        let shards = self.inner.router.all_shards();
        let max_concurrent = self.inner.config.max_concurrent_probes.max(1);

        debug!(
            subsystem = "health",
            op = "check_all",
            num_shards = shards.len(),
            "Running health checks"
        );

        let probes: Vec<_> = shards
            .iter()
            .enumerate()
            .map(|(number, shard)| self.check_shard(number, shard, &thresholds))
            .collect();
        let results: Vec<ShardHealth> = stream::iter(probes)
            .buffer_unordered(max_concurrent)
            .collect()
            .await;

        for health in &results {
            log_shard_health(health);
        }
        {
            let mut snapshots = self.inner.health.write();
            for health in results {
                snapshots.insert(health.shard_id, health);
            }
        }

        self.get_health_summary()
    }

    async fn check_shard(
        &self,
        number: usize,
        shard: &ShardInfo,
        thresholds: &HealthThresholds,
    ) -> ShardHealth {
        let probe_timeout = self.inner.config.probe_timeout;
        let mut health = ShardHealth::unknown(shard.id, shard.host.clone());
        health.last_check_time = Some(Utc::now());

        let conn = match self.inner.router.connection_for_shard(number).await {
            Ok(conn) => conn,
            Err(e) => {
                health.status = HealthStatus::Unhealthy;
                health.message = format!("Connection failed: {}", e);
                return health;
            }
        };

        let start = Instant::now();
        match timeout(probe_timeout, conn.ping()).await {
            Err(_) => {
                health.status = HealthStatus::Unhealthy;
                health.response_time = probe_timeout;
                health.message = format!("Ping timed out after {:?}", probe_timeout);
                return health;
            }
            Ok(Err(e)) => {
                health.status = HealthStatus::Unhealthy;
                health.response_time = start.elapsed();
                health.message = format!("Ping failed: {}", e);
                return health;
            }
            Ok(Ok(())) => {}
        }
        health.response_time = start.elapsed();
        health.is_reachable = true;

        if timeout(probe_timeout, collect_stats(conn.as_ref(), &mut health))
            .await
            .is_err()
        {
            debug!(
                subsystem = "health",
                shard_id = shard.id,
                "Shard statistics timed out"
            );
        }

        if let Some(metrics) = self.inner.metrics.get(&shard.id) {
            health.error_rate = metrics.error_rate();
            health.qps = metrics.qps();
        }

        let (status, message) = classify(
            health.response_time,
            health.error_rate,
            health.replication_lag,
            thresholds,
        );
        health.status = status;
        health.message = message;
        health
    }

    /// Record one query against a shard. Unknown shard ids are ignored.
    pub fn record_query<T, E>(
        &self,
        shard_id: i32,
        latency: Duration,
        result: &std::result::Result<T, E>,
    ) {
        match self.inner.metrics.get(&shard_id) {
            Some(metrics) => metrics.record(latency, result.is_ok()),
            None => debug!(subsystem = "health", shard_id, "Query recorded for unknown shard"),
        }
    }

    /// Zero a shard's query metrics.
    pub fn reset_metrics(&self, shard_id: i32) {
        if let Some(metrics) = self.inner.metrics.get(&shard_id) {
            metrics.reset();
        }
    }

    pub fn get_metrics(&self, shard_id: i32) -> Option<ShardMetricsSnapshot> {
        self.inner.metrics.get(&shard_id).map(ShardMetrics::snapshot)
    }

    /// Latest snapshot of a shard; `Unknown` with "Shard not found" for an
    /// id outside the topology.
    pub fn get_shard_health(&self, shard_id: i32) -> ShardHealth {
        self.inner
            .health
            .read()
            .get(&shard_id)
            .cloned()
            .unwrap_or_else(|| {
                let mut health = ShardHealth::unknown(shard_id, "");
                health.message = "Shard not found".to_string();
                health
            })
    }

    /// Latest snapshot of every shard, ordered by shard id.
    pub fn get_all_health(&self) -> BTreeMap<i32, ShardHealth> {
        self.inner.health.read().clone()
    }

    /// Aggregate the latest snapshots.
    ///
    /// Average latency covers checked shards only. The system is healthy
    /// while no shard is unhealthy.
    pub fn get_health_summary(&self) -> HealthSummary {
        let health = self.inner.health.read();
        let mut summary = HealthSummary {
            total_shards: health.len(),
            healthy_shards: 0,
            degraded_shards: 0,
            unhealthy_shards: 0,
            unknown_shards: 0,
            average_latency: Duration::ZERO,
            system_healthy: true,
            last_check_time: Utc::now(),
        };

        let mut checked = 0u32;
        let mut total_latency = Duration::ZERO;
        for h in health.values() {
            match h.status {
                HealthStatus::Healthy => summary.healthy_shards += 1,
                HealthStatus::Degraded => summary.degraded_shards += 1,
                HealthStatus::Unhealthy => summary.unhealthy_shards += 1,
                HealthStatus::Unknown => summary.unknown_shards += 1,
            }
            if h.is_checked() {
                checked += 1;
                total_latency += h.response_time;
            }
        }
        if checked > 0 {
            summary.average_latency = total_latency / checked;
        }
        summary.system_healthy = summary.unhealthy_shards == 0;
        summary
    }

    pub fn set_health_thresholds(&self, thresholds: HealthThresholds) {
        info!(
            subsystem = "health",
            op = "set_thresholds",
            degraded_ms = thresholds.degraded.as_millis() as u64,
            unhealthy_ms = thresholds.unhealthy.as_millis() as u64,
            max_error_rate = thresholds.max_error_rate,
            "Health thresholds updated"
        );
        *self.inner.thresholds.write() = thresholds;
    }

    pub fn thresholds(&self) -> HealthThresholds {
        *self.inner.thresholds.read()
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Best-effort size, row count and replication lag; failures leave defaults.
async fn collect_stats(conn: &dyn ShardConnection, health: &mut ShardHealth) {
    if let Ok(size) = conn.database_size().await {
        health.database_size = size;
    }
    let mut records = 0;
    for table in MIGRATION_TABLES {
        if let Ok(count) = conn.count_rows(table).await {
            records += count;
        }
    }
    health.record_count = records;
    if let Ok(lag) = conn.replication_lag().await {
        health.replication_lag = lag;
    }
}

fn log_shard_health(health: &ShardHealth) {
    let latency_ms = health.response_time.as_secs_f64() * 1000.0;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Unknown => debug!(
            subsystem = "health",
            op = "probe",
            shard_id = health.shard_id,
            host = %health.host,
            status = %health.status,
            latency_ms,
            error_rate = health.error_rate,
            "Shard checked"
        ),
        HealthStatus::Degraded => warn!(
            subsystem = "health",
            op = "probe",
            shard_id = health.shard_id,
            host = %health.host,
            status = %health.status,
            latency_ms,
            error_rate = health.error_rate,
            reason = %health.message,
            "Shard degraded"
        ),
        HealthStatus::Unhealthy => error!(
            subsystem = "health",
            op = "probe",
            shard_id = health.shard_id,
            host = %health.host,
            status = %health.status,
            latency_ms,
            reason = %health.message,
            "Shard unhealthy"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_classify_latency_bands() {
        let t = HealthThresholds::default();
        assert_eq!(classify(ms(100), 0.0, None, &t).0, HealthStatus::Healthy);
        assert_eq!(classify(ms(500), 0.0, None, &t).0, HealthStatus::Healthy);
        assert_eq!(classify(ms(700), 0.0, None, &t).0, HealthStatus::Degraded);
        assert_eq!(classify(ms(2000), 0.0, None, &t).0, HealthStatus::Degraded);
        assert_eq!(classify(ms(2500), 0.0, None, &t).0, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_classify_messages() {
        let t = HealthThresholds::default();
        assert_eq!(
            classify(ms(2500), 0.0, None, &t).1,
            "Response time too high: 2.5s"
        );
        assert_eq!(classify(ms(100), 0.0, None, &t).1, "Shard is healthy");
        assert_eq!(
            classify(ms(100), 0.1, None, &t).1,
            "Error rate high: 10.00%"
        );
    }

    #[test]
    fn test_classify_error_rate_and_lag() {
        let t = HealthThresholds::default();
        assert_eq!(classify(ms(100), 0.05, None, &t).0, HealthStatus::Healthy);
        assert_eq!(classify(ms(100), 0.06, None, &t).0, HealthStatus::Degraded);
        assert_eq!(
            classify(ms(100), 0.0, Some(Duration::from_secs(11)), &t).0,
            HealthStatus::Degraded
        );
        assert_eq!(
            classify(ms(100), 0.0, Some(Duration::from_secs(3)), &t).0,
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_classify_latency_wins_over_error_rate() {
        let t = HealthThresholds::default();
        let (status, message) = classify(ms(3000), 0.5, None, &t);
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(message.starts_with("Response time too high"));
    }

    #[test]
    fn test_config_builder() {
        let config = HealthCheckerConfig::default()
            .with_check_interval(Duration::from_secs(5))
            .with_max_concurrent_probes(2);
        assert_eq!(config.check_interval, Duration::from_secs(5));
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_probes, 2);
    }
}
