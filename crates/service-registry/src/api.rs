use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::SharedConfig;
use crate::discovery::DeltaResponse;
use crate::error::RegistryError;
use crate::instance::{normalize_app, InstanceInfo, InstanceStatus};
use crate::lease::{Lease, RegistrySnapshot};
use crate::registry::{NodeStatus, Registry};
use crate::replication::{ReplicationAck, ReplicationBatch};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub config: Arc<SharedConfig>,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, config: Arc<SharedConfig>) -> Self {
        Self { registry, config }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppsQuery {
    #[serde(default)]
    pub include_all: bool,
    pub since_version: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: InstanceStatus,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = match &self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidInstance(_) => StatusCode::BAD_REQUEST,
            RegistryError::TooStale { .. } => StatusCode::GONE,
            RegistryError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
            RegistryError::ConfigUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    let timeout = Duration::from_millis(state.config.current().request_timeout_ms);

    Router::new()
        .route("/apps", get(get_apps))
        .route("/apps/{app}", get(get_application).post(register))
        .route("/apps/{app}/{id}", put(renew).delete(cancel))
        .route("/apps/{app}/{id}/status", put(update_status))
        .route("/peer/replicate", post(replicate))
        .route("/peer/snapshot", get(peer_snapshot))
        .route("/admin/status", get(admin_status))
        .route("/admin/refresh", post(admin_refresh))
        .route("/health", get(health))
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn register(
    State(state): State<AppState>,
    Path(app): Path<String>,
    Json(mut info): Json<InstanceInfo>,
) -> Result<StatusCode, RegistryError> {
    if !info.app.is_empty() && normalize_app(&info.app) != normalize_app(&app) {
        return Err(RegistryError::InvalidInstance(format!(
            "body names application {} but path names {}",
            info.app, app
        )));
    }
    info.app = app;
    state.registry.register(info)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn renew(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
) -> Result<Json<Lease>, RegistryError> {
    Ok(Json(state.registry.renew(&app, &id)?))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
) -> StatusCode {
    state.registry.cancel(&app, &id);
    StatusCode::OK
}

pub async fn update_status(
    State(state): State<AppState>,
    Path((app, id)): Path<(String, String)>,
    Json(update): Json<StatusUpdate>,
) -> Result<Json<Lease>, RegistryError> {
    Ok(Json(state.registry.update_status(&app, &id, update.status)?))
}

pub async fn get_application(
    State(state): State<AppState>,
    Path(app): Path<String>,
    Query(query): Query<AppsQuery>,
) -> Json<Vec<Lease>> {
    Json(state.registry.discovery().get_application(&app, query.include_all))
}

pub async fn get_apps(State(state): State<AppState>, Query(query): Query<AppsQuery>) -> Response {
    let discovery = state.registry.discovery();
    match query.since_version {
        Some(since) => Json::<DeltaResponse>(discovery.get_delta(since)).into_response(),
        None => Json::<RegistrySnapshot>(discovery.get_all(query.include_all)).into_response(),
    }
}

pub async fn replicate(
    State(state): State<AppState>,
    Json(batch): Json<ReplicationBatch>,
) -> Json<ReplicationAck> {
    Json(state.registry.apply_replicated(&batch))
}

pub async fn peer_snapshot(State(state): State<AppState>) -> Json<RegistrySnapshot> {
    Json(state.registry.discovery().get_all(true))
}

pub async fn admin_status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.registry.status())
}

pub async fn admin_refresh(State(state): State<AppState>) -> Result<Json<serde_json::Value>, RegistryError> {
    if !state.config.has_remote() {
        return Ok(Json(json!({ "changed": false, "source": "local" })));
    }
    let changed = state.config.refresh().await?;
    Ok(Json(json!({ "changed": changed, "source": "remote" })))
}
