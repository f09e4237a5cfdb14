//! shardctl: operator tool for the restaurant shard fleet.
//!
//! Routes restaurant ids to shards, runs one-shot health checks, drives live
//! shard-to-shard migrations and serves the admin API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardctl_core::defaults;
use shardctl_core::{MigrationConfig, MigrationProgress, ShardConnector, ShardTopology};
use shardctl_db::{PgConnector, PoolConfig, ShardRouter};
use shardctl_health::{HealthChecker, HealthCheckerConfig, MetricsExporter};
use shardctl_migrate::{DualWriteConfig, MigrationRegistry};

#[derive(Parser)]
#[command(name = "shardctl")]
#[command(author, version, about = "Shard routing, health and live migration")]
#[command(propagate_version = true)]
struct Cli {
    /// Shard topology file (JSON or YAML). Falls back to SHARD_CONFIG.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show which shard owns each restaurant id
    Route {
        /// Restaurant ids to route
        #[arg(required = true, num_args = 1..)]
        keys: Vec<String>,
    },

    /// Probe every shard once and report
    Health {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = HealthFormat::Text)]
        format: HealthFormat,
    },

    /// Move all restaurant data from one shard to another
    Migrate {
        /// Shard id to copy from
        #[arg(long)]
        source_shard: i32,

        /// Shard id to copy to
        #[arg(long)]
        target_shard: i32,

        /// Rows per batch
        #[arg(long, default_value_t = defaults::MIGRATION_BATCH_SIZE)]
        batch_size: usize,

        /// Skip row count verification before cutover
        #[arg(long)]
        no_verify: bool,

        /// Keep target rows if the migration fails
        #[arg(long)]
        no_rollback: bool,

        /// Shard id that takes dual writes first (default: source)
        #[arg(long)]
        dual_write_leader: Option<i32>,

        /// Seconds between progress reports
        #[arg(long, default_value_t = defaults::MIGRATION_STATUS_INTERVAL_SECS)]
        status_interval: u64,

        /// Overall deadline in seconds
        #[arg(long, default_value_t = defaults::MIGRATION_TIMEOUT_SECS)]
        timeout: u64,

        /// Delete copied rows from the target when interrupted
        #[arg(long)]
        purge_on_cancel: bool,
    },

    /// Run the health loop and serve the admin HTTP API
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum HealthFormat {
    Text,
    Json,
    Prometheus,
    Alerts,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let _log_guard = init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "shardctl=info")
///
/// Console logs go to stderr so command output on stdout stays parseable.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "shardctl=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    if let Some(ref path) = log_file {
        let path = std::path::Path::new(path);
        let file_dir = path.parent().unwrap_or(std::path::Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("shardctl.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let topology = load_topology(cli.config.as_ref())?;
    info!(
        subsystem = "config",
        num_shards = topology.len(),
        "Shard topology loaded"
    );

    match cli.command {
        Commands::Route { keys } => cmd_route(topology, &keys),
        Commands::Health { format } => cmd_health(topology, format).await,
        Commands::Migrate {
            source_shard,
            target_shard,
            batch_size,
            no_verify,
            no_rollback,
            dual_write_leader,
            status_interval,
            timeout,
            purge_on_cancel,
        } => {
            let mut config = MigrationConfig::new(source_shard, target_shard)
                .with_batch_size(batch_size)
                .with_verify_all(!no_verify)
                .with_rollback_on_error(!no_rollback)
                .with_timeout(Duration::from_secs(timeout));
            if let Some(leader) = dual_write_leader {
                config = config.with_dual_write_leader(leader);
            }
            cmd_migrate(
                topology,
                config,
                Duration::from_secs(status_interval.max(1)),
                purge_on_cancel,
            )
            .await
        }
        Commands::Serve { bind } => cmd_serve(topology, bind).await,
    }
}

fn load_topology(path: Option<&PathBuf>) -> anyhow::Result<ShardTopology> {
    match path {
        Some(path) => ShardTopology::load(path)
            .with_context(|| format!("loading shard topology from {}", path.display())),
        None => ShardTopology::from_env().context("loading shard topology"),
    }
}

fn cmd_route(topology: ShardTopology, keys: &[String]) -> anyhow::Result<ExitCode> {
    let router = ShardRouter::postgres(topology.into_shards(), PoolConfig::from_env())?;
    for key in keys {
        let number = router.shard_number(key);
        let shard = router.get_shard(key);
        println!("{}\tshard={}\tid={}\thost={}", key, number, shard.id, shard.host);
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_health(topology: ShardTopology, format: HealthFormat) -> anyhow::Result<ExitCode> {
    let router = Arc::new(ShardRouter::postgres(
        topology.into_shards(),
        PoolConfig::from_env(),
    )?);
    let checker = HealthChecker::new(router.clone(), HealthCheckerConfig::from_env());
    let summary = checker.check_all_shards().await;
    let exporter = MetricsExporter::new(checker.clone());

    match format {
        HealthFormat::Text => {
            for health in checker.get_all_health().values() {
                println!(
                    "shard {:>3}  {:<10} {:>9.2}ms  {}  ({})",
                    health.shard_id,
                    health.status,
                    health.response_time.as_secs_f64() * 1000.0,
                    health.host,
                    health.message
                );
            }
            println!(
                "\n{} shards: {} healthy, {} degraded, {} unhealthy, average latency {}ms",
                summary.total_shards,
                summary.healthy_shards,
                summary.degraded_shards,
                summary.unhealthy_shards,
                summary.average_latency.as_millis()
            );
        }
        HealthFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&exporter.export_metrics_json())?);
        }
        HealthFormat::Prometheus => print!("{}", exporter.export_metrics()),
        HealthFormat::Alerts => {
            for alert in exporter.generate_alerts() {
                println!("{}", alert);
            }
        }
    }

    router.close().await;
    Ok(if summary.system_healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_migrate(
    topology: ShardTopology,
    config: MigrationConfig,
    status_interval: Duration,
    purge_on_cancel: bool,
) -> anyhow::Result<ExitCode> {
    let source_info = topology.find(config.source_shard_id)?;
    let target_info = topology.find(config.target_shard_id)?;

    let connector = PgConnector::new(PoolConfig::from_env());
    let source = connector
        .connect(source_info)
        .await
        .with_context(|| format!("connecting to source shard {}", source_info.id))?;
    let target = connector
        .connect(target_info)
        .await
        .with_context(|| format!("connecting to target shard {}", target_info.id))?;

    info!(
        subsystem = "migration",
        source_shard = config.source_shard_id,
        source_host = %source_info.host,
        target_shard = config.target_shard_id,
        target_host = %target_info.host,
        batch_size = config.batch_size,
        verify = config.verify_all,
        rollback_on_error = config.rollback_on_error,
        "Starting shard migration"
    );

    let registry = MigrationRegistry::with_dual_write_config(DualWriteConfig::from_env());
    let id = registry.start(config, source.clone(), target.clone())?;
    let migration = registry.get(&id)?;

    let mut run = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move { registry.wait(&id).await })
    };

    let mut ticker = tokio::time::interval(status_interval);
    ticker.tick().await;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let result = loop {
        tokio::select! {
            joined = &mut run => break joined.context("migration task panicked")?,
            _ = ticker.tick() => log_progress(&migration.progress()),
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                warn!(
                    subsystem = "migration",
                    purge = purge_on_cancel,
                    "Interrupt received, cancelling migration"
                );
                if let Err(e) = registry.cancel(&id, purge_on_cancel).await {
                    warn!(subsystem = "migration", error = %e, "Cancel rejected");
                }
            }
        }
    };

    let progress = migration.progress();
    if let Some(dual_writer) = migration.dual_writer() {
        dual_writer.shutdown().await;
        let stats = dual_writer.stats();
        info!(
            subsystem = "dual_write",
            leader_writes = stats.leader_writes,
            follower_writes = stats.follower_writes,
            follower_lost = stats.follower_lost(),
            "Dual-write totals"
        );
    }
    source.close().await;
    target.close().await;

    print_report(&progress);
    match result {
        Ok(()) => {
            info!(
                subsystem = "migration",
                migrated = progress.migrated_records,
                elapsed_secs = progress.elapsed_seconds,
                "Migration completed"
            );
            Ok(ExitCode::SUCCESS)
        }
        Err(e) if e.is_cancelled() => {
            warn!(subsystem = "migration", "Migration cancelled");
            Ok(ExitCode::from(130))
        }
        Err(e) => {
            error!(subsystem = "migration", error = %e, "Migration failed");
            eprintln!("Error: {}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_serve(topology: ShardTopology, bind: SocketAddr) -> anyhow::Result<ExitCode> {
    let router = Arc::new(ShardRouter::postgres(
        topology.into_shards(),
        PoolConfig::from_env(),
    )?);
    let checker = HealthChecker::new(router.clone(), HealthCheckerConfig::from_env());
    checker.check_all_shards().await;
    checker.start();

    let registry = MigrationRegistry::with_dual_write_config(DualWriteConfig::from_env());
    let state = shardctl_api::AppState::new(checker.clone(), registry);

    let served = tokio::select! {
        result = shardctl_api::serve(state, bind) => result.context("admin API stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!(subsystem = "api", "Interrupt received, shutting down");
            Ok(())
        }
    };

    checker.stop().await;
    router.close().await;
    served.map(|()| ExitCode::SUCCESS)
}

fn log_progress(progress: &MigrationProgress) {
    info!(
        subsystem = "migration",
        state = %progress.state,
        table = progress.current_table.as_deref().unwrap_or("-"),
        migrated = progress.migrated_records,
        total = progress.total_records,
        failed = progress.failed_records,
        percent = progress.percent_complete,
        rate = progress.rate(),
        eta_secs = progress.eta_seconds().unwrap_or(-1),
        "Migration progress"
    );
}

fn print_report(progress: &MigrationProgress) {
    println!("Migration {}", progress.state);
    println!(
        "  records:  {} / {} migrated, {} failed, {} verified",
        progress.migrated_records,
        progress.total_records,
        progress.failed_records,
        progress.verified_records
    );
    println!("  progress: {:.1}%", progress.percent_complete);
    println!(
        "  elapsed:  {}s ({:.1} rows/s)",
        progress.elapsed_seconds,
        progress.rate()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_migrate_defaults() {
        let cli = Cli::parse_from([
            "shardctl",
            "migrate",
            "--source-shard",
            "1",
            "--target-shard",
            "4",
        ]);
        match cli.command {
            Commands::Migrate {
                source_shard,
                target_shard,
                batch_size,
                no_verify,
                timeout,
                purge_on_cancel,
                ..
            } => {
                assert_eq!(source_shard, 1);
                assert_eq!(target_shard, 4);
                assert_eq!(batch_size, defaults::MIGRATION_BATCH_SIZE);
                assert!(!no_verify);
                assert_eq!(timeout, defaults::MIGRATION_TIMEOUT_SECS);
                assert!(!purge_on_cancel);
            }
            _ => panic!("Expected migrate command"),
        }
    }

    #[test]
    fn test_serve_bind_address() {
        let cli = Cli::parse_from(["shardctl", "serve", "--bind", "0.0.0.0:9090"]);
        match cli.command {
            Commands::Serve { bind } => assert_eq!(bind, "0.0.0.0:9090".parse().unwrap()),
            _ => panic!("Expected serve command"),
        }
    }

    #[test]
    fn test_health_format_and_global_config() {
        let cli = Cli::parse_from(["shardctl", "health", "--format", "prometheus", "-c", "shards.yaml"]);
        assert_eq!(cli.config, Some(PathBuf::from("shards.yaml")));
        assert!(matches!(
            cli.command,
            Commands::Health {
                format: HealthFormat::Prometheus
            }
        ));
    }
}
