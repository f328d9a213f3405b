//! HTTP API Server
//!
//! Operator endpoints: status, write log inspection, cleanup, manual
//! reset, and collection mapping repair.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::capture::CaptureFilter;
use crate::config::ApiConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::health::{HealthSnapshot, HealthTracker};
use crate::mapping::{CollectionMapper, CollectionMapping};
use crate::replay::{ReplayEngine, ReplayStatsSnapshot};
use crate::wal::{EntrySummary, StatusCounts, WriteLogStore, WriteStatus};

/// Shared application state
pub struct AppState {
    pub db: Arc<Database>,
    pub store: Arc<WriteLogStore>,
    pub mapper: Arc<CollectionMapper>,
    pub health: Arc<HealthTracker>,
    /// Absent when replay is disabled in this process
    pub engine: Option<Arc<ReplayEngine>>,
    /// Absent when this process runs no front door
    pub capture: Option<Arc<CaptureFilter>>,
}

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self {
            config,
            state: Arc::new(state),
        }
    }

    /// Create the router
    pub fn create_router(state: Arc<AppState>, cors_enabled: bool) -> Router {
        let router = Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            // Write log
            .route("/wal/entries", get(handle_entries))
            .route("/wal/entries/:write_id/reset", post(handle_reset_entry))
            .route("/wal/cleanup", post(handle_cleanup))
            // Collection mappings
            .route("/collection/mappings", get(handle_list_mappings))
            .route("/admin/mappings", post(handle_set_mapping))
            .route("/admin/mappings/:name", delete(handle_remove_mapping))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        if cors_enabled {
            router.layer(CorsLayer::new().allow_methods(Any).allow_origin(Any))
        } else {
            router
        }
    }

    /// Serve until `shutdown` flips to true
    pub async fn start(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state), self.config.cors_enabled);
        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await?;
        Ok(())
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub store_ok: bool,
    pub primary_healthy: bool,
    pub replica_healthy: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub counts: StatusCounts,
    pub outstanding: u64,
    pub health: HealthSnapshot,
    pub replay: Option<ReplayStatsSnapshot>,
    /// Accepted writes the front door could not log
    pub capture_failures: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct EntriesQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupRequest {
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
    #[serde(default)]
    pub reset_failed: bool,
}

fn default_max_age_hours() -> u64 {
    24
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupResponse {
    pub deleted: u64,
    pub reset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub write_id: String,
    pub reset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MappingRequest {
    pub collection_name: String,
    pub primary_collection_id: Option<String>,
    pub replica_collection_id: Option<String>,
    #[serde(default)]
    pub collection_config: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveMappingResponse {
    pub collection_name: String,
    pub removed: bool,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(e: Error) -> Response {
    let (status, code) = match &e {
        Error::EntryNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        Error::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
        Error::Config(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        Error::Store(_) => (StatusCode::SERVICE_UNAVAILABLE, "STORE_ERROR"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = match state.db.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Health check: {}", e);
            false
        }
    };
    let health = state.health.snapshot();
    let response = HealthResponse {
        healthy: store_ok && (health.primary_healthy || health.replica_healthy),
        store_ok,
        primary_healthy: health.primary_healthy,
        replica_healthy: health.replica_healthy,
    };
    let status = if response.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Response {
    match state.store.counts_by_status().await {
        Ok(counts) => Json(StatusResponse {
            outstanding: counts.outstanding(),
            counts,
            health: state.health.snapshot(),
            replay: state.engine.as_ref().map(|e| e.stats()),
            capture_failures: state.capture.as_ref().map(|c| c.failures()),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_entries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EntriesQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<WriteStatus>).transpose() {
        Ok(status) => status,
        Err(e) => return error_response(Error::Config(e.to_string())),
    };
    let limit = query.limit.unwrap_or(100).min(1_000);

    match state.store.list(status, limit).await {
        Ok(entries) => {
            let summaries: Vec<EntrySummary> = entries.iter().map(|e| e.summary()).collect();
            Json(summaries).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_reset_entry(
    State(state): State<Arc<AppState>>,
    Path(write_id): Path<String>,
) -> Response {
    match state.store.reset_failed(Some(&write_id)).await {
        Ok(reset) => {
            tracing::info!("Operator reset entry {}", write_id);
            Json(ResetResponse { write_id, reset }).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_cleanup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanupRequest>,
) -> Response {
    let reset = if req.reset_failed {
        match state.store.reset_failed(None).await {
            Ok(n) => n,
            Err(e) => return error_response(e),
        }
    } else {
        0
    };

    let max_age = Duration::from_secs(req.max_age_hours.saturating_mul(3_600));
    let statuses = [WriteStatus::Synced, WriteStatus::CleanupPending, WriteStatus::Failed];
    match state.store.cleanup(max_age, &statuses).await {
        Ok(deleted) => {
            tracing::info!(
                "Operator cleanup: deleted {} entries older than {}h, reset {}",
                deleted,
                req.max_age_hours,
                reset
            );
            Json(CleanupResponse { deleted, reset }).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_list_mappings(State(state): State<Arc<AppState>>) -> Response {
    match state.mapper.list().await {
        Ok(mappings) => Json(mappings).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_set_mapping(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MappingRequest>,
) -> Response {
    if req.collection_name.is_empty() {
        return error_response(Error::Config("collection_name cannot be empty".into()));
    }

    let result: Result<CollectionMapping> = state
        .mapper
        .upsert(
            &req.collection_name,
            req.primary_collection_id.as_deref(),
            req.replica_collection_id.as_deref(),
            &req.collection_config,
        )
        .await;
    match result {
        Ok(mapping) => {
            tracing::info!("Operator set mapping for {}", mapping.collection_name);
            Json(mapping).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_remove_mapping(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.mapper.remove(&name).await {
        Ok(removed) => {
            let status = if removed {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            };
            (
                status,
                Json(RemoveMappingResponse {
                    collection_name: name,
                    removed,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}
