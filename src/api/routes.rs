//! REST endpoints: uploads, condition evaluation, message preview, jobs.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{AppState, error_response};
use crate::conditions::Condition;
use crate::error::{Error, SheetError};
use crate::jobs::{ControlOutcome, CreateJobRequest};
use crate::sheet::{CellValue, Row, Sheet};
use crate::sheet::store::DEFAULT_PREVIEW_LIMIT;
use crate::template;

pub fn rest_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/upload", post(upload).get(list_uploads))
        .route("/api/upload/{id}", get(get_upload).delete(delete_upload))
        .route("/api/upload/{id}/preview", get(preview_upload))
        .route("/api/conditions/evaluate", post(evaluate_conditions))
        .route("/api/messages/preview", post(preview_message))
        .route("/api/messages/send", post(send_messages))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{id}", get(job_status).delete(purge_job))
        .route("/api/jobs/{id}/pause", post(pause_job))
        .route("/api/jobs/{id}/resume", post(resume_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, (StatusCode, Json<serde_json::Value>)> {
    Uuid::parse_str(raw).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("Invalid {what} ID"), "code": "VALIDATION_ERROR"})),
        )
    })
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "bulk-send"
    }))
}

// ── Uploads ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadRequest {
    file_name: String,
    headers: Vec<String>,
    rows: Vec<Vec<CellValue>>,
    #[serde(default)]
    phone_column: Option<String>,
}

async fn upload(
    State(state): State<AppState>,
    Json(body): Json<UploadRequest>,
) -> impl IntoResponse {
    match Sheet::from_table(body.file_name, body.headers, body.rows, body.phone_column) {
        Ok(sheet) => {
            let summary = state.sheets.insert(sheet).await;
            (StatusCode::CREATED, Json(json!(summary)))
        }
        Err(e) => error_response(&e.into()),
    }
}

async fn list_uploads(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sheets.list().await)
}

async fn get_upload(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let file_id = match parse_id(&id, "file") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.sheets.summary(file_id).await {
        Some(summary) => (StatusCode::OK, Json(json!(summary))),
        None => error_response(&SheetError::NotFound { id: file_id }.into()),
    }
}

#[derive(Deserialize)]
struct PreviewQuery {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn preview_upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PreviewQuery>,
) -> impl IntoResponse {
    let file_id = match parse_id(&id, "file") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_PREVIEW_LIMIT);
    match state.sheets.preview(file_id, page, limit).await {
        Some(preview) => (StatusCode::OK, Json(json!(preview))),
        None => error_response(&SheetError::NotFound { id: file_id }.into()),
    }
}

async fn delete_upload(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let file_id = match parse_id(&id, "file") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if state.sheets.remove(file_id).await {
        (StatusCode::OK, Json(json!({"status": "deleted"})))
    } else {
        error_response(&SheetError::NotFound { id: file_id }.into())
    }
}

// ── Conditions & templates ──────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateRequest {
    file_id: Uuid,
    #[serde(default)]
    conditions: Vec<Condition>,
}

async fn evaluate_conditions(
    State(state): State<AppState>,
    Json(body): Json<EvaluateRequest>,
) -> impl IntoResponse {
    match state.manager.evaluate(body.file_id, &body.conditions).await {
        Ok(result) => (StatusCode::OK, Json(json!(result))),
        Err(e) => error_response(&e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreviewMessageRequest {
    template: String,
    #[serde(default)]
    file_id: Option<Uuid>,
    /// Row to render against; defaults to the file's first row.
    #[serde(default)]
    data: Option<Row>,
}

async fn preview_message(
    State(state): State<AppState>,
    Json(body): Json<PreviewMessageRequest>,
) -> impl IntoResponse {
    match state
        .manager
        .preview_message(&body.template, body.file_id, body.data)
        .await
    {
        Ok(rendered) => (
            StatusCode::OK,
            Json(json!({
                "message": rendered.text,
                "variables": template::extract_variables(&body.template),
                "unresolved": rendered.unresolved,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn send_messages(
    State(state): State<AppState>,
    Json(body): Json<CreateJobRequest>,
) -> impl IntoResponse {
    match state.manager.create_job(body).await {
        Ok(created) => {
            info!(job_id = %created.job_id, total = created.total_messages, "Send request accepted");
            (StatusCode::CREATED, Json(json!(created)))
        }
        Err(e) => error_response(&e),
    }
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list_jobs().await)
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.status(job_id).await {
        Ok(status) => (StatusCode::OK, Json(json!(status))),
        Err(e) => error_response(&e),
    }
}

async fn purge_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let job_id = match parse_id(&id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.manager.purge(job_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "purged"}))),
        Err(e) => error_response(&e),
    }
}

#[derive(Clone, Copy)]
enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

async fn control(state: &AppState, id: &str, action: ControlAction) -> (StatusCode, Json<serde_json::Value>) {
    let job_id = match parse_id(id, "job") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let result = match action {
        ControlAction::Pause => state.manager.pause(job_id).await,
        ControlAction::Resume => state.manager.resume(job_id).await,
        ControlAction::Cancel => state.manager.cancel(job_id).await,
    };
    control_response(result)
}

/// Terminal jobs answer 409 so callers can tell "already done" from "accepted".
fn control_response(result: Result<ControlOutcome, Error>) -> (StatusCode, Json<serde_json::Value>) {
    match result {
        Ok(outcome @ ControlOutcome::AlreadyTerminal { status }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": format!("Job is already {status}"),
                "code": "JOB_TERMINAL",
                "outcome": outcome,
            })),
        ),
        Ok(outcome) => (StatusCode::OK, Json(json!(outcome))),
        Err(e) => error_response(&e),
    }
}

async fn pause_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    control(&state, &id, ControlAction::Pause).await
}

async fn resume_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    control(&state, &id, ControlAction::Resume).await
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    control(&state, &id, ControlAction::Cancel).await
}
