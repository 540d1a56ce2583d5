use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::auth;
use crate::config::Config;
use crate::error::SessionError;
use crate::metrics::Metrics;
use crate::runner::{RunRequest, Runner};
use crate::session::SessionRegistry;

pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub metrics: Arc<Metrics>,
    pub runner: Arc<Runner>,
    pub started_at: chrono::DateTime<Utc>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/session", post(create_session))
        .route("/session/:id/status", get(session_status))
        .route("/session/:id/download", get(download))
        .route("/evaluate", post(evaluate))
        .route("/evaluate/:id", get(get_run))
        .route("/admin/reap", post(reap))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Serialize)]
struct StatusResponse {
    version: String,
    uptime_secs: i64,
    active_runs: u64,
    total_runs: u64,
    completed: u64,
    failed: u64,
    active_sessions: usize,
    judge_bound: usize,
    search_bound: usize,
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        active_runs: state.metrics.runs_active.load(Ordering::Relaxed),
        total_runs: state.metrics.runs_total.load(Ordering::Relaxed),
        completed: state.metrics.runs_completed.load(Ordering::Relaxed),
        failed: state.metrics.runs_failed.load(Ordering::Relaxed),
        active_sessions: state.sessions.active_count(),
        judge_bound: state.config.max_concurrent_judge,
        search_bound: state.config.max_concurrent_search,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let body = state.metrics.render_prometheus();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

async fn create_session(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = state.sessions.create().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create session workspace: {e}"),
        )
    })?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "session_id": handle.session_id })),
    ))
}

#[derive(Serialize)]
struct SessionStatusResponse {
    is_valid: bool,
    file_count: usize,
    files: Vec<SessionFileEntry>,
}

#[derive(Serialize)]
struct SessionFileEntry {
    path: String,
    size_bytes: u64,
    created_at: String,
}

async fn session_status(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Json<SessionStatusResponse> {
    match state.sessions.files(&id) {
        Ok(files) => Json(SessionStatusResponse {
            is_valid: true,
            file_count: files.len(),
            files: files
                .into_iter()
                .map(|f| SessionFileEntry {
                    path: f.path.display().to_string(),
                    size_bytes: f.size_bytes,
                    created_at: f.created_at.to_rfc3339(),
                })
                .collect(),
        }),
        Err(_) => Json(SessionStatusResponse {
            is_valid: false,
            file_count: 0,
            files: Vec::new(),
        }),
    }
}

async fn download(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let path = match state.sessions.latest_output_file(&id) {
        Ok(Some(path)) => path,
        Ok(None) => {
            return Err((
                StatusCode::NOT_FOUND,
                "no artifact registered for this session".to_string(),
            ))
        }
        Err(SessionError::NotFound) => {
            return Err((StatusCode::NOT_FOUND, SessionError::NotFound.to_string()))
        }
        Err(e) => return Err((StatusCode::BAD_REQUEST, e.to_string())),
    };

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("artifact unreadable: {e}"),
        )
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "evaluation_output.json".to_string());

    Ok((
        StatusCode::OK,
        [
            ("content-type", "application/json".to_string()),
            (
                "content-disposition",
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn evaluate(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<RunRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // Auth check
    if let Some(ref expected) = state.config.auth_token {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !auth::check_token(auth_header, expected) {
            return Err((StatusCode::UNAUTHORIZED, "Invalid token".to_string()));
        }
    }

    // A stale session is the client's problem to fix by creating a new one;
    // reject before spawning anything.
    if !state.sessions.is_valid(&payload.session_id) {
        return Err((
            StatusCode::NOT_FOUND,
            SessionError::NotFound.to_string(),
        ));
    }

    if payload.sheets.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "at least one sheet is required".to_string(),
        ));
    }

    let total_rows: usize = payload.sheets.iter().map(|s| s.rows.len()).sum();
    if total_rows > state.config.max_rows_per_request {
        return Err((
            StatusCode::BAD_REQUEST,
            format!(
                "request too large ({} rows, max {})",
                total_rows, state.config.max_rows_per_request
            ),
        ));
    }

    let run_id = state.runner.clone().spawn_run(payload);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id })),
    ))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run = state.runner.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    let run = run.lock().await;
    serde_json::to_value(&*run)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Deserialize)]
struct ReapPayload {
    #[serde(default = "default_reap_age")]
    max_age_hours: i64,
}

fn default_reap_age() -> i64 {
    24
}

async fn reap(
    State(state): State<Arc<AppState>>,
    headers: axum::http::HeaderMap,
    Json(payload): Json<ReapPayload>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(ref expected) = state.config.auth_token {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !auth::check_token(auth_header, expected) {
            return Err((StatusCode::UNAUTHORIZED, "Invalid token".to_string()));
        }
    }

    let reaped = state.sessions.reap(payload.max_age_hours.max(0));
    Ok(Json(serde_json::json!({ "reaped": reaped })))
}
