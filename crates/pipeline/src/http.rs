// HTTP routes
//
// Thin axum mapping onto `VideoPipeline`. Status codes:
// 202 accepted, 400 bad input, 404 unknown code or instance,
// 409 closed instance, 410 stale generation.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use reelflow_durable::{ExecutorError, RegistryError, WorkflowEventStore, WorkflowInstance};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::models::{RaisedEvent, StartedWorkflow};
use crate::service::{PipelineError, VideoPipeline};

/// Standard error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Start request; fields may also come from the query string
#[derive(Debug, Default, Deserialize)]
pub struct ProcessVideoRequest {
    pub video: Option<String>,
    pub approval_timeout_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    pub generation: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApprovalQuery {
    pub result: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PeriodicQuery {
    pub interval_seconds: Option<u64>,
    pub max_iterations: Option<u64>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<(StatusCode, Json<T>), ApiError>;

/// Status code a pipeline error maps to
pub fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PipelineError::UnknownTarget(_) => StatusCode::NOT_FOUND,
        PipelineError::Engine(engine) => match engine {
            ExecutorError::WorkflowNotFound(_) => StatusCode::NOT_FOUND,
            ExecutorError::WorkflowClosed(_) => StatusCode::CONFLICT,
            ExecutorError::StaleGeneration { .. } => StatusCode::GONE,
            ExecutorError::Registry(RegistryError::Deserialization(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        PipelineError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(err: PipelineError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    } else {
        tracing::debug!(error = %err, status = status.as_u16(), "request rejected");
    }
    (status, Json(ErrorResponse::new(err.to_string())))
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

/// Parse an optional JSON body; an empty body is `None`
fn json_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<Option<T>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| bad_request(&format!("invalid JSON body: {err}")))
}

/// Routes for the pipeline, with request tracing
pub fn routes<S: WorkflowEventStore>(pipeline: Arc<VideoPipeline<S>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/process-video", post(process_video::<S>))
        .route("/api/workflows/:id", get(get_status::<S>))
        .route("/api/workflows/:target/events/:name", post(raise_event::<S>))
        .route(
            "/api/approvals/:code",
            get(submit_approval::<S>).post(submit_approval::<S>),
        )
        .route("/api/periodic", post(start_periodic::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// POST /api/process-video?video=... or body `{"video": ...}`
async fn process_video<S: WorkflowEventStore>(
    State(pipeline): State<Arc<VideoPipeline<S>>>,
    Query(query): Query<ProcessVideoRequest>,
    body: Bytes,
) -> ApiResult<StartedWorkflow> {
    let body: ProcessVideoRequest = json_body(&body)?.unwrap_or_default();
    let video = query.video.or(body.video).unwrap_or_default();
    if video.trim().is_empty() {
        return Err(bad_request(
            "Please pass a video location on the query string or in the request body",
        ));
    }
    let approval_timeout = query
        .approval_timeout_seconds
        .or(body.approval_timeout_seconds)
        .map(Duration::from_secs);

    let started = pipeline
        .start_workflow_with(&video, approval_timeout)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

/// GET /api/workflows/:id
async fn get_status<S: WorkflowEventStore>(
    State(pipeline): State<Arc<VideoPipeline<S>>>,
    Path(id): Path<Uuid>,
) -> ApiResult<WorkflowInstance> {
    let instance = pipeline.get_status(id).await.map_err(api_error)?;
    Ok((StatusCode::OK, Json(instance)))
}

/// POST /api/workflows/:target/events/:name
///
/// `target` is an instance id or a correlation code.
async fn raise_event<S: WorkflowEventStore>(
    State(pipeline): State<Arc<VideoPipeline<S>>>,
    Path((target, name)): Path<(String, String)>,
    Query(query): Query<EventQuery>,
    body: Bytes,
) -> ApiResult<RaisedEvent> {
    let payload = json_body(&body)?.unwrap_or(serde_json::Value::Null);
    let raised = pipeline
        .raise_event(&target, &name, payload, query.generation)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(raised)))
}

/// GET or POST /api/approvals/:code?result=Approved
async fn submit_approval<S: WorkflowEventStore>(
    State(pipeline): State<Arc<VideoPipeline<S>>>,
    Path(code): Path<String>,
    Query(query): Query<ApprovalQuery>,
) -> ApiResult<RaisedEvent> {
    let Some(result) = query.result.filter(|r| !r.trim().is_empty()) else {
        return Err(bad_request("Need an approval result"));
    };
    let raised = pipeline
        .submit_approval(&code, &result)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(raised)))
}

/// POST /api/periodic
async fn start_periodic<S: WorkflowEventStore>(
    State(pipeline): State<Arc<VideoPipeline<S>>>,
    Query(query): Query<PeriodicQuery>,
) -> ApiResult<StartedWorkflow> {
    let started = pipeline
        .start_periodic(
            query.interval_seconds.map(Duration::from_secs),
            query.max_iterations,
        )
        .await
        .map_err(api_error)?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}
