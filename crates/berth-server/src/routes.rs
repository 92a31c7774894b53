use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use berth_core::jobservice::TASK_HOOK_PATH;
use berth_core::models::{CoreError, CoreErrorKind, StatusChange};
use berth_core::task::HookHandler;
use serde::Serialize;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub hook: Arc<HookHandler>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            &format!("{TASK_HOOK_PATH}/{{task_id}}"),
            post(task_status_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

pub fn status_for(kind: CoreErrorKind) -> StatusCode {
    match kind {
        CoreErrorKind::NotFound => StatusCode::NOT_FOUND,
        CoreErrorKind::Denied => StatusCode::FORBIDDEN,
        CoreErrorKind::Conflict => StatusCode::CONFLICT,
        CoreErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
        CoreErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        CoreErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
        CoreErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        CoreErrorKind::Cancelled | CoreErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(kind: CoreErrorKind) -> &'static str {
    match kind {
        CoreErrorKind::NotFound => "NOT_FOUND",
        CoreErrorKind::Denied => "FORBIDDEN",
        CoreErrorKind::Conflict => "CONFLICT",
        CoreErrorKind::PreconditionFailed => "PRECONDITION",
        CoreErrorKind::BadRequest => "BAD_REQUEST",
        CoreErrorKind::Transient => "UNAVAILABLE",
        CoreErrorKind::DeadlineExceeded => "TIMEOUT",
        CoreErrorKind::Cancelled | CoreErrorKind::Internal => "UNKNOWN",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.0.kind);
        if status.is_server_error() {
            tracing::error!(kind = ?self.0.kind, message = %self.0.message, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                code: error_code(self.0.kind),
                message: self.0.message,
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

/// Job status callbacks. A non-2xx answer makes the job service retransmit.
async fn task_status_handler(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
    Json(change): Json<StatusChange>,
) -> Result<StatusCode, ApiError> {
    tracing::debug!(
        task_id,
        job_id = %change.job_id,
        status = %change.status,
        revision = change.metadata.revision,
        "task status hook received"
    );
    state.hook.handle(task_id, change).await?;
    Ok(StatusCode::OK)
}
