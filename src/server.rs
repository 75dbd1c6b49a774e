//! JSON HTTP API.
//!
//! A thin layer over the store and the request functions in [`crate::scan`].
//! Scans and OCR runs are queued on the dispatcher; clients poll the status
//! fields to follow them.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/projects` | List projects |
//! | `POST` | `/projects` | Create a project |
//! | `GET`  | `/projects/{id}` | One project |
//! | `GET`  | `/projects/{id}/tasks` | Tasks of a project, abandoned included |
//! | `POST` | `/projects/{id}/scan` | Queue a scan |
//! | `POST` | `/projects/{id}/ocr?force=` | Queue OCR for every eligible task |
//! | `POST` | `/tasks/{id}/ocr?force=` | Queue OCR for one task |
//! | `GET`  | `/tasks/{id}/ocr` | The task's current OCR result |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "project not found: ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use mrkr_core::error::ConsistencyError;
use mrkr_core::models::{NewProject, OcrResult, Project, Task};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::jobs::start_dispatcher;
use crate::scan::{request_ocr, request_project_ocr, request_scan};
use crate::services::Services;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub dispatcher: Dispatcher,
}

/// Build the router. Exposed so tests can serve it on an ephemeral port.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/projects", get(handle_list_projects).post(handle_create_project))
        .route("/projects/{id}", get(handle_get_project))
        .route("/projects/{id}/tasks", get(handle_list_tasks))
        .route("/projects/{id}/scan", post(handle_scan))
        .route("/projects/{id}/ocr", post(handle_project_ocr))
        .route("/tasks/{id}/ocr", post(handle_task_ocr).get(handle_get_ocr))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `[server] bind` until Ctrl-C, then let queued jobs finish.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config).await?;
    let dispatcher = start_dispatcher(&services)?;
    let app = router(AppState {
        services,
        dispatcher: dispatcher.clone(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "mrkr server listening");
    println!("mrkr server listening on http://{}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down; waiting for queued jobs");
    dispatcher.shutdown().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

/// Map typed domain errors to HTTP; anything else is a 500.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        let consistency = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ConsistencyError>());
        match consistency {
            Some(ConsistencyError::ProjectNotFound(_) | ConsistencyError::TaskNotFound(_)) => {
                not_found(message)
            }
            Some(_) => AppError {
                status: StatusCode::CONFLICT,
                code: "conflict",
                message,
            },
            None => {
                error!("Request failed: {}", message);
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message,
                }
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

// ============ Handlers ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_list_projects(State(state): State<AppState>) -> ApiResult<Vec<Project>> {
    Ok(Json(state.services.store.list_projects().await?))
}

async fn handle_create_project(
    State(state): State<AppState>,
    Json(project): Json<NewProject>,
) -> Result<(StatusCode, Json<Project>), AppError> {
    if project.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    if project.source.uri.trim().is_empty() {
        return Err(bad_request("source.uri must not be empty"));
    }
    let project = state
        .services
        .store
        .create_project(project, Utc::now())
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn handle_get_project(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Project> {
    match state.services.store.get_project(&id).await? {
        Some(project) => Ok(Json(project)),
        None => Err(not_found(format!("project not found: {}", id))),
    }
}

async fn handle_list_tasks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Task>> {
    if state.services.store.get_project(&id).await?.is_none() {
        return Err(not_found(format!("project not found: {}", id)));
    }
    Ok(Json(state.services.store.list_tasks(&id).await?))
}

#[derive(Serialize)]
struct Queued {
    /// `false` while an earlier attempt is inside its staleness window.
    queued: bool,
}

#[derive(Serialize)]
struct QueuedCount {
    queued: usize,
}

#[derive(Deserialize)]
struct OcrParams {
    #[serde(default)]
    force: bool,
}

async fn handle_scan(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Queued> {
    let queued = request_scan(&state.services, &state.dispatcher, &id).await?;
    Ok(Json(Queued { queued }))
}

async fn handle_project_ocr(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<OcrParams>,
) -> ApiResult<QueuedCount> {
    if state.services.store.get_project(&id).await?.is_none() {
        return Err(not_found(format!("project not found: {}", id)));
    }
    let queued =
        request_project_ocr(&state.services, &state.dispatcher, &id, params.force).await?;
    Ok(Json(QueuedCount { queued }))
}

async fn handle_task_ocr(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<OcrParams>,
) -> ApiResult<Queued> {
    let queued = request_ocr(&state.services, &state.dispatcher, &id, params.force).await?;
    Ok(Json(Queued { queued }))
}

async fn handle_get_ocr(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<OcrResult> {
    let store = &state.services.store;
    let task = store
        .get_task(&id)
        .await?
        .ok_or_else(|| not_found(format!("task not found: {}", id)))?;
    let Some(ocr_id) = task.ocr_id else {
        return Err(not_found(format!("task {} has no OCR result", id)));
    };
    match store.get_ocr_result(&ocr_id).await? {
        Some(result) => Ok(Json(result)),
        None => Err(not_found(format!("OCR result not found: {}", ocr_id))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn wrapped_consistency_errors_keep_their_status() {
        let err: anyhow::Result<()> = Err(ConsistencyError::TaskNotFound("t1".to_string()).into());
        let err = err.context("while queueing OCR").unwrap_err();
        let app = AppError::from(err);
        assert_eq!(app.status, StatusCode::NOT_FOUND);
        assert_eq!(app.code, "not_found");

        let err: anyhow::Result<()> = Err(ConsistencyError::DuplicateUri {
            uri: "a.pdf".to_string(),
        }
        .into());
        let app = AppError::from(err.context("scan").unwrap_err());
        assert_eq!(app.status, StatusCode::CONFLICT);
    }

    #[test]
    fn other_errors_are_internal() {
        let app = AppError::from(anyhow::anyhow!("disk full"));
        assert_eq!(app.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(app.code, "internal");
    }
}
