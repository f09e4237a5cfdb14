//! Admin endpoint handlers.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use shardctl_core::MigrationConfig;

use crate::error::ApiError;
use crate::AppState;

/// Body of a migration start request. Omitted options take the defaults.
#[derive(Debug, Deserialize)]
pub struct StartMigrationRequest {
    pub source_shard_id: i32,
    pub target_shard_id: i32,
    pub batch_size: Option<usize>,
    pub verify_data: Option<bool>,
    pub rollback_on_error: Option<bool>,
    pub dual_write_leader: Option<i32>,
    pub timeout_seconds: Option<u64>,
}

impl StartMigrationRequest {
    pub fn into_config(self) -> MigrationConfig {
        let mut config = MigrationConfig::new(self.source_shard_id, self.target_shard_id);
        if let Some(n) = self.batch_size {
            config = config.with_batch_size(n);
        }
        if let Some(verify) = self.verify_data {
            config = config.with_verify_all(verify);
        }
        if let Some(rollback) = self.rollback_on_error {
            config = config.with_rollback_on_error(rollback);
        }
        if let Some(leader) = self.dual_write_leader {
            config = config.with_dual_write_leader(leader);
        }
        if let Some(secs) = self.timeout_seconds {
            config = config.with_timeout(std::time::Duration::from_secs(secs));
        }
        config
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams {
    #[serde(default)]
    pub purge: bool,
}

fn shard_number(state: &AppState, shard_id: i32) -> Result<usize, ApiError> {
    state
        .router
        .all_shards()
        .iter()
        .position(|s| s.id == shard_id)
        .ok_or_else(|| ApiError::NotFound(format!("Shard not found: {}", shard_id)))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.checker.get_health_summary();
    let (status, label) = if summary.system_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    (
        status,
        Json(json!({
            "status": label,
            "version": env!("CARGO_PKG_VERSION"),
            "total_shards": summary.total_shards,
            "healthy_shards": summary.healthy_shards,
            "degraded_shards": summary.degraded_shards,
            "unhealthy_shards": summary.unhealthy_shards,
        })),
    )
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.exporter.export_metrics(),
    )
}

pub async fn list_shards(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.exporter.export_metrics_json())
}

pub async fn start_migration(
    State(state): State<AppState>,
    Json(req): Json<StartMigrationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = req.into_config();
    config.validate()?;

    let source_number = shard_number(&state, config.source_shard_id)?;
    let target_number = shard_number(&state, config.target_shard_id)?;
    let source = state.router.connection_for_shard(source_number).await?;
    let target = state.router.connection_for_shard(target_number).await?;

    let id = state.registry.start(config, source, target)?;
    let status = state.registry.status(&id)?;
    info!(
        subsystem = "api",
        op = "start_migration",
        migration_id = %id,
        "Migration accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "migration_id": id,
            "state": status.state,
            "message": "Migration started in background",
        })),
    ))
}

pub async fn list_migrations(State(state): State<AppState>) -> impl IntoResponse {
    let migrations = state.registry.list();
    Json(json!({
        "count": migrations.len(),
        "migrations": migrations,
    }))
}

pub async fn get_migration(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.registry.status(&id)?))
}

pub async fn cancel_migration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<CancelParams>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.registry.cancel(&id, params.purge).await?;
    info!(
        subsystem = "api",
        op = "cancel_migration",
        migration_id = %id,
        purge = params.purge,
        "Migration cancelled"
    );
    Ok(Json(json!({
        "migration_id": status.migration_id,
        "state": status.state,
        "message": "Migration cancellation initiated",
    })))
}

pub async fn shard_stats(
    State(state): State<AppState>,
    Path(shard_id): Path<i32>,
) -> Result<impl IntoResponse, ApiError> {
    let number = shard_number(&state, shard_id)?;
    let ping = match state.router.connection_for_shard(number).await {
        Ok(conn) => conn.ping().await,
        Err(e) => Err(e),
    };

    let mut body = json!({
        "shard_id": shard_id,
        "healthy": ping.is_ok(),
        "health": state.checker.get_shard_health(shard_id),
        "metrics": state.checker.get_metrics(shard_id),
        "active_migration": state.registry.active_for_shard(shard_id),
    });
    if let Err(e) = ping {
        body["error"] = json!(e.to_string());
    }
    Ok(Json(body))
}
