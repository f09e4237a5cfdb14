//! # shardctl-health
//!
//! Shard health checking and metrics export.
//!
//! - `HealthChecker`: periodic probes, per-shard query metrics, summaries
//! - `MetricsExporter`: Prometheus text, JSON and alert rendering

pub mod checker;
pub mod exporter;
pub mod metrics;

pub use checker::{classify, HealthChecker, HealthCheckerConfig};
pub use exporter::MetricsExporter;
pub use metrics::ShardMetrics;
