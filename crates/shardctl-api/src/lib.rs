//! # shardctl-api
//!
//! Admin HTTP surface over the shard router, health checker and migration
//! registry.
//!
//! | Route | Method | |
//! |---|---|---|
//! | `/health` | GET | fleet health summary, 503 when unhealthy |
//! | `/metrics` | GET | Prometheus text exposition |
//! | `/api/v1/admin/shards` | GET | per-shard health as JSON |
//! | `/api/v1/admin/shards/:shard_id/stats` | GET | live ping plus last health and metrics |
//! | `/api/v1/admin/migrations` | GET, POST | list or start migrations |
//! | `/api/v1/admin/migrations/:id` | GET | migration status |
//! | `/api/v1/admin/migrations/:id/cancel` | POST | cancel, `?purge=true` empties the target |

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use shardctl_db::ShardRouter;
use shardctl_health::{HealthChecker, MetricsExporter};
use shardctl_migrate::MigrationRegistry;

pub mod error;
pub mod handlers;

pub use error::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ShardRouter>,
    pub checker: HealthChecker,
    pub exporter: MetricsExporter,
    pub registry: MigrationRegistry,
}

impl AppState {
    pub fn new(checker: HealthChecker, registry: MigrationRegistry) -> Self {
        Self {
            router: checker.router().clone(),
            exporter: MetricsExporter::new(checker.clone()),
            checker,
            registry,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/admin/shards", get(handlers::list_shards))
        .route(
            "/api/v1/admin/shards/:shard_id/stats",
            get(handlers::shard_stats),
        )
        .route(
            "/api/v1/admin/migrations",
            get(handlers::list_migrations).post(handlers::start_migration),
        )
        .route("/api/v1/admin/migrations/:id", get(handlers::get_migration))
        .route(
            "/api/v1/admin/migrations/:id/cancel",
            post(handlers::cancel_migration),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until the listener fails.
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        subsystem = "api",
        addr = %listener.local_addr()?,
        "Admin API listening"
    );
    axum::serve(listener, app(state)).await
}
