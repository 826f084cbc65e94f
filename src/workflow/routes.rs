//! REST endpoints and the workflow event WebSocket.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::approval::ApprovalCoordinator;
use super::engine::WorkflowEngine;
use super::events::Subscription;
use super::model::{ApprovalStatus, Decision};
use crate::error::{ApprovalError, WorkflowError};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: WorkflowEngine,
    pub approvals: ApprovalCoordinator,
}

impl AppState {
    pub fn new(engine: WorkflowEngine) -> Self {
        Self {
            approvals: ApprovalCoordinator::new(engine.clone()),
            engine,
        }
    }
}

/// Build the Axum router for workflows, approvals and event streams.
pub fn workflow_routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/onboarding/{employee_id}/start", post(start_workflow))
        .route("/api/onboarding/{employee_id}/status", get(employee_status))
        .route("/api/workflows/{id}", get(get_workflow))
        .route("/api/workflows/{id}/pause", post(pause_workflow))
        .route("/api/workflows/{id}/resume", post(resume_workflow))
        .route("/api/workflows/{id}/retry", post(retry_workflow))
        .route("/ws/workflows/{id}", get(ws_handler))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/pending/count", get(pending_count))
        .route("/api/approvals/employee/{employee_id}", get(employee_approvals))
        .route("/api/approvals/{id}", get(get_approval))
        .route("/api/approvals/{id}/{decision}", post(decide))
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(state)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
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
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<WorkflowError> for ApiError {
    fn from(e: WorkflowError) -> Self {
        let status = match &e {
            WorkflowError::NotFound { .. } | WorkflowError::NoWorkflowForEmployee { .. } => {
                StatusCode::NOT_FOUND
            }
            WorkflowError::AlreadyRunning { .. }
            | WorkflowError::NotRunning { .. }
            | WorkflowError::NotPaused { .. }
            | WorkflowError::NoFailedSteps { .. }
            | WorkflowError::Closed { .. } => StatusCode::CONFLICT,
            WorkflowError::EngineUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            WorkflowError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %e, "Workflow request failed");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        if let ApprovalError::Workflow(inner) = e {
            return inner.into();
        }
        let status = match &e {
            ApprovalError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApprovalError::AlreadyResolved { .. } | ApprovalError::WorkflowClosed { .. } => {
                StatusCode::CONFLICT
            }
            ApprovalError::InvalidDecision(_) => StatusCode::BAD_REQUEST,
            ApprovalError::Workflow(_) | ApprovalError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %e, "Approval request failed");
        }
        Self {
            status,
            message: e.to_string(),
        }
    }
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {what} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "onboarding-orchestrator"
    }))
}

// ── Workflows ───────────────────────────────────────────────────────────

async fn start_workflow(
    State(state): State<AppState>,
    Path(employee_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let employee_id = employee_id.trim();
    if employee_id.is_empty() {
        return Err(ApiError::bad_request("Employee ID is required"));
    }
    let workflow_id = state.engine.start(employee_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "workflow_id": workflow_id, "employee_id": employee_id })),
    ))
}

async fn employee_status(
    State(state): State<AppState>,
    Path(employee_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.engine.latest_for_employee(&employee_id).await?))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "workflow")?;
    Ok(Json(state.engine.snapshot(id).await?))
}

async fn pause_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "workflow")?;
    state.engine.pause(id).await?;
    Ok(Json(json!({ "ok": true, "status": "paused" })))
}

async fn resume_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "workflow")?;
    state.engine.resume(id).await?;
    let snapshot = state.engine.snapshot(id).await?;
    Ok(Json(json!({ "ok": true, "status": snapshot.workflow.status })))
}

async fn retry_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "workflow")?;
    let reset = state.engine.retry_failed(id).await?;
    Ok(Json(json!({ "ok": true, "retried": reset })))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_id(&id, "workflow")?;
    // Fail before upgrading so unknown workflows get a plain 404.
    let subscription = state.engine.subscribe(id).await?;
    info!(workflow_id = %id, "WebSocket client connecting");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, id, subscription)))
}

async fn handle_socket(mut socket: WebSocket, workflow_id: Uuid, subscription: Subscription) {
    let events = subscription.into_stream();
    tokio::pin!(events);

    loop {
        tokio::select! {
            next = events.next() => {
                let Some(event) = next else {
                    debug!(workflow_id = %workflow_id, "Event stream ended");
                    break;
                };
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Client disconnected during send");
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize workflow event"),
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(workflow_id = %workflow_id, "WebSocket client disconnected");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        return;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    info!(workflow_id = %workflow_id, "WebSocket connection closed");
}

// ── Approvals ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApprovalQuery {
    status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DecisionBody {
    reviewer: Option<String>,
    notes: Option<String>,
}

async fn list_approvals(
    State(state): State<AppState>,
    Query(query): Query<ApprovalQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(s) => Some(s.parse::<ApprovalStatus>().map_err(ApiError::bad_request)?),
    };
    Ok(Json(state.approvals.list(status).await?))
}

async fn pending_count(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let count = state.approvals.pending_count().await?;
    Ok(Json(json!({ "count": count })))
}

async fn employee_approvals(
    State(state): State<AppState>,
    Path(employee_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.approvals.for_employee(&employee_id).await?))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "approval")?;
    Ok(Json(state.approvals.get(id).await?))
}

/// POST /api/approvals/{id}/{approve|reject|revision}
async fn decide(
    State(state): State<AppState>,
    Path((id, decision)): Path<(String, String)>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&id, "approval")?;
    let decision: Decision = decision.parse().map_err(ApprovalError::InvalidDecision)?;
    let body: DecisionBody = if body.is_empty() {
        DecisionBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))?
    };

    let approval = state
        .approvals
        .resolve(id, decision, body.reviewer, body.notes)
        .await?;
    info!(approval_id = %id, status = %approval.status, "Approval decided via REST");
    Ok(Json(approval))
}
