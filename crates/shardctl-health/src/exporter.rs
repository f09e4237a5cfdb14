//! Prometheus text, JSON and alert views over health checker state.

use std::fmt::Write as _;

use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use shardctl_core::{HealthStatus, ShardHealth};

use crate::checker::HealthChecker;

/// Escape a Prometheus label value.
fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn write_header(out: &mut String, name: &str, help: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
}

/// Renders a [`HealthChecker`]'s snapshots for monitoring systems.
#[derive(Debug, Clone)]
pub struct MetricsExporter {
    checker: HealthChecker,
}

impl MetricsExporter {
    pub fn new(checker: HealthChecker) -> Self {
        Self { checker }
    }

    /// Prometheus text exposition of every shard and the system summary.
    ///
    /// Shards appear in shard id order.
    pub fn export_metrics(&self) -> String {
        let health = self.checker.get_all_health();
        let summary = self.checker.get_health_summary();
        let mut out = String::with_capacity(4096);

        let shard_gauge = |out: &mut String,
                           name: &str,
                           help: &str,
                           value: &dyn Fn(&ShardHealth) -> String| {
            write_header(out, name, help);
            for h in health.values() {
                let _ = writeln!(
                    out,
                    "{}{{shard_id=\"{}\",host=\"{}\"}} {}",
                    name,
                    h.shard_id,
                    escape_label(&h.host),
                    value(h)
                );
            }
            out.push('\n');
        };

        shard_gauge(
            &mut out,
            "shard_health_status",
            "Shard health status (0=unknown, 1=healthy, 2=degraded, 3=unhealthy)",
            &|h| h.status.code().to_string(),
        );
        shard_gauge(
            &mut out,
            "shard_response_time_ms",
            "Shard response time in milliseconds",
            &|h| format!("{:.2}", h.response_time.as_secs_f64() * 1000.0),
        );
        shard_gauge(
            &mut out,
            "shard_error_rate_percentage",
            "Shard error rate in percentage",
            &|h| format!("{:.2}", h.error_rate * 100.0),
        );
        shard_gauge(
            &mut out,
            "shard_queries_per_second",
            "Shard queries per second",
            &|h| format!("{:.2}", h.qps),
        );
        shard_gauge(
            &mut out,
            "shard_database_size_bytes",
            "Shard database size in bytes",
            &|h| h.database_size.to_string(),
        );
        shard_gauge(
            &mut out,
            "shard_record_count",
            "Total records in shard",
            &|h| h.record_count.to_string(),
        );
        shard_gauge(
            &mut out,
            "shard_reachable",
            "Shard reachability (1=reachable, 0=unreachable)",
            &|h| u8::from(h.is_reachable).to_string(),
        );

        let system: [(&str, &str, String); 6] = [
            (
                "system_shards_total",
                "Total number of shards",
                summary.total_shards.to_string(),
            ),
            (
                "system_shards_healthy",
                "Number of healthy shards",
                summary.healthy_shards.to_string(),
            ),
            (
                "system_shards_degraded",
                "Number of degraded shards",
                summary.degraded_shards.to_string(),
            ),
            (
                "system_shards_unhealthy",
                "Number of unhealthy shards",
                summary.unhealthy_shards.to_string(),
            ),
            (
                "system_average_latency_ms",
                "Average latency across all shards",
                summary.average_latency.as_millis().to_string(),
            ),
            (
                "system_health",
                "System health status (1=healthy, 0=degraded)",
                u8::from(summary.system_healthy).to_string(),
            ),
        ];
        for (name, help, value) in system {
            write_header(&mut out, name, help);
            let _ = writeln!(out, "{} {}", name, value);
            out.push('\n');
        }

        out
    }

    /// `{timestamp, system, shards}` with shards in id order.
    pub fn export_metrics_json(&self) -> JsonValue {
        let health = self.checker.get_all_health();
        let summary = self.checker.get_health_summary();
        json!({
            "timestamp": Utc::now(),
            "system": summary,
            "shards": health.values().collect::<Vec<_>>(),
        })
    }

    /// Human-readable alert lines for degraded, unhealthy and unreachable
    /// shards, plus a system line when any shard is unhealthy.
    ///
    /// Shards that have not been checked yet raise no alerts.
    pub fn generate_alerts(&self) -> Vec<String> {
        let mut alerts = Vec::new();

        for h in self.checker.get_all_health().values() {
            match h.status {
                HealthStatus::Unhealthy => alerts.push(format!(
                    "CRITICAL: Shard {} is unhealthy - {}",
                    h.shard_id, h.message
                )),
                HealthStatus::Degraded => alerts.push(format!(
                    "WARNING: Shard {} is degraded - {}",
                    h.shard_id, h.message
                )),
                HealthStatus::Healthy | HealthStatus::Unknown => {}
            }
            if h.is_checked() && !h.is_reachable {
                alerts.push(format!("CRITICAL: Shard {} is unreachable", h.shard_id));
            }
        }

        let summary = self.checker.get_health_summary();
        if !summary.system_healthy {
            alerts.push(format!(
                "CRITICAL: System is not healthy - {} healthy, {} degraded, {} unhealthy",
                summary.healthy_shards, summary.degraded_shards, summary.unhealthy_shards
            ));
        }

        alerts
    }

    /// Log the summary and one line per shard.
    pub fn log_metrics(&self) {
        let summary = self.checker.get_health_summary();
        info!(
            subsystem = "metrics",
            total_shards = summary.total_shards,
            healthy = summary.healthy_shards,
            degraded = summary.degraded_shards,
            unhealthy = summary.unhealthy_shards,
            unknown = summary.unknown_shards,
            average_latency_ms = summary.average_latency.as_millis() as u64,
            "System health summary"
        );

        for h in self.checker.get_all_health().values() {
            let latency_ms = h.response_time.as_secs_f64() * 1000.0;
            let error_pct = h.error_rate * 100.0;
            if matches!(h.status, HealthStatus::Healthy | HealthStatus::Unknown) {
                info!(
                    subsystem = "metrics",
                    shard_id = h.shard_id,
                    status = %h.status,
                    latency_ms,
                    error_pct,
                    qps = h.qps,
                    "Shard metrics"
                );
            } else {
                warn!(
                    subsystem = "metrics",
                    shard_id = h.shard_id,
                    status = %h.status,
                    latency_ms,
                    error_pct,
                    qps = h.qps,
                    reason = %h.message,
                    "Shard metrics"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_label() {
        assert_eq!(escape_label("db-1"), "db-1");
        assert_eq!(escape_label("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
    }
}
