use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::ws::{BroadcastObserver, EventSender};
use crate::errors::{RemoteError, ServiceError, SyncError, VastError};
use crate::media::scan_media;
use crate::ssh::keys::read_public_key;
use crate::ssh::remote::{detect_ui_home, read_ui_home, set_ui_home, test_connection};
use crate::sync::SyncService;
use crate::util::tail_lines;
use crate::vast::{CreateInstance, OfferQuery};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: Arc<SyncService>,
    pub ws_tx: EventSender,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    fn observer(&self) -> BroadcastObserver {
        BroadcastObserver::new(self.ws_tx.clone())
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

#[derive(Deserialize)]
pub struct MediaQuery {
    pub recent: Option<usize>,
}

#[derive(Deserialize)]
pub struct TargetRequest {
    pub target: String,
}

#[derive(Deserialize)]
pub struct UiHomeQuery {
    pub target: String,
    #[serde(default)]
    pub detect: bool,
}

#[derive(Deserialize)]
pub struct SetUiHomeRequest {
    pub target: String,
    /// Detected on the host when omitted.
    pub path: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateInstanceRequest {
    pub offer_id: u64,
    pub image: Option<String>,
    pub disk_gb: Option<f64>,
    pub label: Option<String>,
    pub onstart: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[derive(Deserialize)]
pub struct AttachKeyRequest {
    /// Defaults to the configured key's `.pub` file.
    pub public_key: Option<String>,
}

#[derive(Serialize)]
pub struct UiHomeResponse {
    pub target: String,
    pub ui_home: Option<String>,
    pub detected: bool,
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub run_id: i64,
    pub cancelled: bool,
}

#[derive(Serialize)]
pub struct LogResponse {
    pub run_id: i64,
    pub lines: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let msg = err.to_string();
        match err {
            ServiceError::RunNotFound { .. } => ApiError::NotFound(msg),
            ServiceError::BadRequest(_) => ApiError::BadRequest(msg),
            ServiceError::Sync(SyncError::UnknownTarget(_)) => ApiError::NotFound(msg),
            ServiceError::Sync(SyncError::TargetBusy { .. }) => ApiError::Conflict(msg),
            ServiceError::Vast(VastError::MissingApiKey | VastError::Rejected(_)) => {
                ApiError::BadRequest(msg)
            }
            ServiceError::Remote(RemoteError::UiHomeNotFound { .. }) => ApiError::NotFound(msg),
            _ => ApiError::Internal(format!("{:#}", anyhow::Error::new(err))),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ServiceError::from(err).into()
    }
}

impl From<RemoteError> for ApiError {
    fn from(err: RemoteError) -> Self {
        ServiceError::from(err).into()
    }
}

impl From<VastError> for ApiError {
    fn from(err: VastError) -> Self {
        ServiceError::from(err).into()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/targets", get(list_targets))
        .route("/api/sync", post(sync_all))
        .route("/api/sync/{target}", post(sync_target))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/log", get(get_run_log))
        .route("/api/progress", get(list_progress))
        .route("/api/progress/{id}", get(get_progress))
        .route("/api/media", get(media_inventory))
        .route("/api/ssh/test", post(ssh_test))
        .route("/api/ssh/ui-home", get(get_ui_home).post(post_ui_home))
        .route(
            "/api/vast/instances",
            get(vast_list_instances).post(vast_create_instance),
        )
        .route(
            "/api/vast/instances/{id}",
            get(vast_show_instance).delete(vast_destroy_instance),
        )
        .route("/api/vast/instances/{id}/ssh-key", post(vast_attach_key))
        .route("/api/vast/offers", get(vast_search_offers))
}

// ── Sync handlers ─────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_targets(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.target_statuses().await?))
}

async fn sync_target(
    State(state): State<SharedState>,
    Path(target): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.service.queue(&target).await?;

    // The rsync runs in the background; clients poll progress or listen on /ws.
    let service = Arc::clone(&state.service);
    let observer = state.observer();
    let queued = run.clone();
    tokio::spawn(async move {
        if let Err(e) = service.execute(queued, &observer).await {
            tracing::warn!(error = %e, "background sync failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn sync_all(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.service.queue_all().await?;

    let service = Arc::clone(&state.service);
    let observer = state.observer();
    let queued = runs.clone();
    tokio::spawn(async move {
        let outcomes = service.run_queued(queued, &observer).await;
        tracing::info!(runs = outcomes.len(), "sync of all targets finished");
    });

    Ok((StatusCode::ACCEPTED, Json(runs)))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state.service.list_runs(query.limit.unwrap_or(50)).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_run(id).await?))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let cancelled = state.service.cancel(id).await?;
    Ok(Json(CancelResponse {
        run_id: id,
        cancelled,
    }))
}

async fn get_run_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.get_run(id).await?;
    let path = state.service.runner().log_path(id);
    let lines = query.lines.unwrap_or(200).min(5000);
    let lines = if path.exists() {
        tokio::task::spawn_blocking(move || tail_lines(&path, lines))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??
    } else {
        Vec::new()
    };
    Ok(Json(LogResponse { run_id: id, lines }))
}

async fn list_progress(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.progress_store().list()?))
}

async fn get_progress(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    match state.service.progress_store().read(id)? {
        Some(progress) => Ok(Json(progress)),
        None => Err(ApiError::NotFound(format!("No progress for run {}", id))),
    }
}

async fn media_inventory(
    State(state): State<SharedState>,
    Query(query): Query<MediaQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let root = state.service.config().media_root();
    let extensions = state.service.config().toml.rsync.extensions.clone();
    let recent = query.recent.unwrap_or(50).min(1000);
    let inventory = tokio::task::spawn_blocking(move || scan_media(&root, &extensions, recent))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(inventory))
}

// ── SSH handlers ──────────────────────────────────────────────────────

async fn ssh_test(
    State(state): State<SharedState>,
    Json(req): Json<TargetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state.service.target(&req.target)?;
    let endpoint = state.service.resolve_endpoint(target).await?;
    Ok(Json(test_connection(state.service.shell(), &endpoint).await))
}

async fn get_ui_home(
    State(state): State<SharedState>,
    Query(query): Query<UiHomeQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state.service.target(&query.target)?;
    let endpoint = state.service.resolve_endpoint(target).await?;
    let shell = state.service.shell();

    let mut ui_home = read_ui_home(shell, &endpoint).await?;
    let mut detected = false;
    if ui_home.is_none() && query.detect {
        ui_home = detect_ui_home(shell, &endpoint, target.kind).await?;
        detected = ui_home.is_some();
    }
    Ok(Json(UiHomeResponse {
        target: target.name.clone(),
        ui_home,
        detected,
    }))
}

async fn post_ui_home(
    State(state): State<SharedState>,
    Json(req): Json<SetUiHomeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let target = state.service.target(&req.target)?;
    let endpoint = state.service.resolve_endpoint(target).await?;
    let shell = state.service.shell();

    let (path, detected) = match req.path.filter(|p| !p.trim().is_empty()) {
        Some(path) => (path, false),
        None => {
            let found = detect_ui_home(shell, &endpoint, target.kind)
                .await?
                .ok_or_else(|| RemoteError::UiHomeNotFound {
                    host: endpoint.host.clone(),
                })?;
            (found, true)
        }
    };
    set_ui_home(shell, &endpoint, &path).await?;
    Ok(Json(UiHomeResponse {
        target: target.name.clone(),
        ui_home: Some(path.trim_end_matches('/').to_string()),
        detected,
    }))
}

// ── VastAI handlers ───────────────────────────────────────────────────

async fn vast_list_instances(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.vast()?.list_instances().await?))
}

async fn vast_show_instance(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.vast()?.show_instance(id).await?))
}

async fn vast_create_instance(
    State(state): State<SharedState>,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let vast = state.service.vast()?;
    let mut request = CreateInstance::from_config(&state.service.config().toml.vast);
    if let Some(image) = req.image {
        request.image = image;
    }
    if let Some(disk) = req.disk_gb {
        if disk <= 0.0 {
            return Err(ApiError::BadRequest("disk_gb must be positive".into()));
        }
        request.disk = disk;
    }
    if req.onstart.is_some() {
        request.onstart = req.onstart;
    }
    request.label = req.label;
    request.env.extend(req.env);
    for port in req.ports {
        request.expose_port(port);
    }

    let instance_id = vast.create_instance(req.offer_id, &request).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({"instance_id": instance_id})),
    ))
}

async fn vast_destroy_instance(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.vast()?.destroy_instance(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn vast_attach_key(
    State(state): State<SharedState>,
    Path(id): Path<u64>,
    Json(req): Json<AttachKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let vast = state.service.vast()?;
    let key = match req.public_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => key,
        None => read_public_key(&state.service.config().default_identity_file())
            .map_err(|e| ApiError::BadRequest(format!("{:#}", e)))?,
    };
    vast.attach_ssh_key(id, &key).await?;
    Ok(Json(serde_json::json!({"instance_id": id, "attached": true})))
}

async fn vast_search_offers(
    State(state): State<SharedState>,
    Query(query): Query<OfferQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.vast()?.search_offers(&query).await?))
}
