//! Dashboard route handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;

use stepflow_core::{ExecutionRecord, ExecutionStatus, StepRecord};
use stepflow_engine::{Client, EngineError, SubmitRequest};
use stepflow_storage::{
    DocStore, ExecutionFilter, QueueKeys, QueueStore, SortOrder, StoreError,
};

/// Shared state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<Client>,
    pub docs: Arc<dyn DocStore>,
    pub queue: Arc<dyn QueueStore>,
    pub keys: QueueKeys,
}

/// Build the dashboard router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/executions", get(list_executions))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/retry", post(retry_execution))
        .route("/stats", get(stats))
        .route("/send", post(send_event))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Standard error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ExecutionNotFound(id) => {
                Self::not_found(format!("execution not found: {id}"))
            }
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Store(store) => store.into(),
            other => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<i64>,
    skip: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    data: Vec<ExecutionRecord>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(params): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let filter = match params.status.as_deref() {
        Some(raw) => {
            let status = ExecutionStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status: {raw}")))?;
            ExecutionFilter::by_status(status)
        }
        None => ExecutionFilter::default(),
    };
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let skip = params.skip.unwrap_or(0).max(0);

    let data = state
        .docs
        .list_executions(&filter, SortOrder::Descending, limit, skip)
        .await?;
    Ok(Json(ListResponse { data }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionDetail {
    execution: ExecutionRecord,
    steps: Vec<StepRecord>,
    /// The raw KV hash, exactly as workers read it.
    kv_execution: HashMap<String, String>,
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let execution = state
        .docs
        .find_execution(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("execution not found: {id}")))?;
    let steps = state.docs.list_steps(&id).await?;
    let kv_execution = state.queue.hash_get_all(&state.keys.execution(&id)).await?;

    Ok(Json(ExecutionDetail {
        execution,
        steps,
        kv_execution,
    }))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    success: bool,
}

async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ApiError> {
    state.client.manual_retry(&id).await?;
    Ok(Json(RetryResponse { success: true }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    queued: u64,
    processing: u64,
    completed: u64,
    failed: u64,
    retrying: u64,
    total: u64,
}

async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let docs = &state.docs;
    let (queued, processing, completed, failed, retrying, total) = futures_join(
        docs.count_executions(Some(ExecutionStatus::Queued)),
        docs.count_executions(Some(ExecutionStatus::Processing)),
        docs.count_executions(Some(ExecutionStatus::Completed)),
        docs.count_executions(Some(ExecutionStatus::Failed)),
        docs.count_executions(Some(ExecutionStatus::Retrying)),
        docs.count_executions(None),
    )
    .await?;

    Ok(Json(StatsResponse {
        queued,
        processing,
        completed,
        failed,
        retrying,
        total,
    }))
}

// Six-way try-join without pulling a combinator crate into the route layer.
async fn futures_join<T>(
    a: impl std::future::Future<Output = Result<T, StoreError>>,
    b: impl std::future::Future<Output = Result<T, StoreError>>,
    c: impl std::future::Future<Output = Result<T, StoreError>>,
    d: impl std::future::Future<Output = Result<T, StoreError>>,
    e: impl std::future::Future<Output = Result<T, StoreError>>,
    f: impl std::future::Future<Output = Result<T, StoreError>>,
) -> Result<(T, T, T, T, T, T), StoreError> {
    let (a, b, c, d, e, f) = tokio::join!(a, b, c, d, e, f);
    Ok((a?, b?, c?, d?, e?, f?))
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    success: bool,
    execution_id: String,
}

async fn send_event(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, ApiError> {
    if request.name.is_empty() {
        return Err(ApiError::bad_request("event name must not be empty"));
    }
    let execution_id = state
        .client
        .submit(SubmitRequest::new(request.name, request.data))
        .await?;
    Ok(Json(SendResponse {
        success: true,
        execution_id,
    }))
}
