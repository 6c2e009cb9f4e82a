//! Axum HTTP surface for registrant sync and counts.

use std::sync::Arc;

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use byteon_core::TrackedEntity;
use byteon_sync::{build_service, maybe_build_scheduler, EntitySyncResult, SyncConfig, SyncError, SyncService};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "byteon-web";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService>,
    cron_secret: Option<String>,
}

impl AppState {
    /// Without a `cron_secret`, credential-gated requests are always rejected.
    /// Surrounding whitespace is ignored, and a blank secret counts as unset.
    pub fn new(service: Arc<SyncService>, cron_secret: Option<String>) -> Self {
        Self {
            service,
            cron_secret: cron_secret
                .map(|secret| secret.trim().to_string())
                .filter(|secret| !secret.is_empty()),
        }
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.cron_secret.as_deref() else {
            return false;
        };
        let Some(presented) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        else {
            return false;
        };
        Sha256::digest(presented.trim().as_bytes()) == Sha256::digest(expected.as_bytes())
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid credentials")]
    Unauthorized,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("rendering template: {0}")]
    Template(#[from] askama::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Sync(SyncError::EntityNotFound { .. } | SyncError::NoSource { .. }) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Sync(SyncError::Source(_) | SyncError::Store(_)) | ApiError::Template(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub message: String,
    pub results: Vec<EntitySyncResult>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Template)]
#[template(path = "badge.html")]
struct BadgeTemplate {
    id: String,
    count_text: String,
    synced_text: String,
    error_text: String,
}

impl From<&TrackedEntity> for BadgeTemplate {
    fn from(entity: &TrackedEntity) -> Self {
        Self {
            id: entity.id.clone(),
            count_text: entity
                .cached_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
            synced_text: entity
                .last_synced_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into()),
            error_text: entity.last_sync_error.clone().unwrap_or_default(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/sync", get(sync_handler).post(gated_sync_handler))
        .route("/api/entities/{id}", get(entity_handler))
        .route("/api/entities/{id}/count", get(count_handler))
        .route("/entities/{id}/badge", get(badge_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let port: u16 = std::env::var("BYTEON_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);

    let service = Arc::new(build_service(&config).await?);
    let scheduler = maybe_build_scheduler(Arc::clone(&service), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }
    if config.cron_secret.is_none() {
        warn!("CRON_SECRET not set; POST /api/sync will reject every request");
    }

    let state = AppState::new(service, config.cron_secret.clone());
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "registrant tracker listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    info!("registrant tracker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
    }
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    run_sync(&state, query.id.as_deref()).await
}

async fn gated_sync_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
) -> Result<Json<SyncResponse>, ApiError> {
    if !state.authorized(&headers) {
        warn!("rejected unauthenticated sync trigger");
        return Err(ApiError::Unauthorized);
    }
    run_sync(&state, query.id.as_deref()).await
}

async fn run_sync(state: &AppState, filter: Option<&str>) -> Result<Json<SyncResponse>, ApiError> {
    let report = state.service.sync_all(filter).await?;
    Ok(Json(SyncResponse {
        message: format!(
            "synced {} of {} entities",
            report.succeeded(),
            report.results.len()
        ),
        timestamp: report.finished_at.to_rfc3339(),
        results: report.results,
    }))
}

async fn entity_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TrackedEntity>, ApiError> {
    Ok(Json(state.service.entity(&id).await?))
}

async fn count_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CountResponse>, ApiError> {
    let count = state.service.count_one(&id).await?;
    Ok(Json(CountResponse { count }))
}

async fn badge_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Html<String>, ApiError> {
    let entity = state.service.entity(&id).await?;
    Ok(Html(BadgeTemplate::from(&entity).render()?))
}
