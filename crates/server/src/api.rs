//! JSON surface over the orchestrator.
//!
//! Failures leave the handlers as [`InterfaceError`]s and render with the correlation id that
//! was logged alongside the underlying cause.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use syncso_agent::{AgentRuntime, AgentSummary, SessionContext};
use syncso_core::domain::agent::AgentContext;
use syncso_core::domain::workflow::WorkflowResult;
use syncso_core::errors::{ApplicationError, InterfaceError};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    runtime: AgentRuntime,
}

impl ApiState {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self { runtime }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/agents", get(list_agents))
        .route("/v1/sessions/{session_id}/messages", post(post_message))
        .route("/v1/sessions/{session_id}", delete(delete_session))
        .with_state(state)
}

#[derive(Clone, Debug, Deserialize)]
pub struct MessageRequest {
    pub message: String,
    #[serde(default)]
    pub context: Option<AgentContext>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionCleared {
    pub session_id: String,
    pub removed: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_application(error: ApplicationError, correlation_id: &str) -> Self {
        warn!(
            event_name = "server.request.failed",
            correlation_id,
            error = %error,
            "request failed"
        );
        Self(error.into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Only caller mistakes echo their cause back.
        let detail = match &self.0 {
            InterfaceError::BadRequest { message, .. } => Some(message.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.0.user_message().to_string(),
            detail,
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn list_agents(State(state): State<ApiState>) -> Json<Vec<AgentSummary>> {
    Json(state.runtime.orchestrator().agent_capabilities(None))
}

async fn post_message(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
    payload: Result<Json<MessageRequest>, JsonRejection>,
) -> Result<Json<WorkflowResult>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let Json(request) = payload.map_err(|rejection| {
        ApiError::from_application(
            ApplicationError::InvalidRequest(rejection.body_text()),
            &correlation_id,
        )
    })?;

    let session = SessionContext::new(session_id)
        .with_context(request.context.unwrap_or_default());
    let result = state
        .runtime
        .orchestrator()
        .handle(&request.message, &session)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;

    info!(
        event_name = "server.message.handled",
        correlation_id = %correlation_id,
        session_id = %session.session_id,
        run_id = %result.run_id,
        status = ?result.overall_status,
        "message handled"
    );
    Ok(Json(result))
}

async fn delete_session(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionCleared>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let removed = state
        .runtime
        .orchestrator()
        .clear_session(&session_id)
        .await
        .map_err(|error| ApiError::from_application(error, &correlation_id))?;
    Ok(Json(SessionCleared { session_id, removed }))
}
