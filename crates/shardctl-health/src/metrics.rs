//! Per-shard query metrics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use shardctl_core::ShardMetricsSnapshot;

#[derive(Debug)]
struct Counters {
    total_queries: u64,
    failed_queries: u64,
    total_latency: Duration,
    max_latency: Duration,
    min_latency: Option<Duration>,
    reset_at: Instant,
    last_reset_time: DateTime<Utc>,
}

impl Counters {
    fn new() -> Self {
        Self {
            total_queries: 0,
            failed_queries: 0,
            total_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            min_latency: None,
            reset_at: Instant::now(),
            last_reset_time: Utc::now(),
        }
    }
}

/// Cumulative query counters for one shard since the last reset.
#[derive(Debug)]
pub struct ShardMetrics {
    shard_id: i32,
    counters: Mutex<Counters>,
}

impl ShardMetrics {
    pub fn new(shard_id: i32) -> Self {
        Self {
            shard_id,
            counters: Mutex::new(Counters::new()),
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    /// Record one query's latency and outcome.
    pub fn record(&self, latency: Duration, success: bool) {
        let mut c = self.counters.lock();
        c.total_queries += 1;
        c.total_latency += latency;
        c.max_latency = c.max_latency.max(latency);
        c.min_latency = Some(c.min_latency.map_or(latency, |min| min.min(latency)));
        if !success {
            c.failed_queries += 1;
        }
    }

    /// Zero all counters and restart the QPS window.
    pub fn reset(&self) {
        *self.counters.lock() = Counters::new();
    }

    /// Failed over total queries; 0 when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        let c = self.counters.lock();
        if c.total_queries == 0 {
            return 0.0;
        }
        c.failed_queries as f64 / c.total_queries as f64
    }

    /// Queries per second since the last reset; 0 for an empty window.
    pub fn qps(&self) -> f64 {
        let c = self.counters.lock();
        let elapsed = c.reset_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        c.total_queries as f64 / elapsed
    }

    pub fn snapshot(&self) -> ShardMetricsSnapshot {
        let error_rate = self.error_rate();
        let qps = self.qps();
        let c = self.counters.lock();
        let avg_latency = if c.total_queries > 0 {
            let nanos = c.total_latency.as_nanos() / u128::from(c.total_queries);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        } else {
            Duration::ZERO
        };
        ShardMetricsSnapshot {
            shard_id: self.shard_id,
            total_queries: c.total_queries,
            failed_queries: c.failed_queries,
            error_rate,
            avg_latency,
            max_latency: c.max_latency,
            min_latency: c.min_latency.unwrap_or_default(),
            qps,
            last_reset_time: c.last_reset_time,
        }
    }
}
