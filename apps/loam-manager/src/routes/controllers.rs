use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::state::{AppState, ControllerSummary, MessageRecord};

use super::{ApiResult, AuthToken};

#[derive(Debug, Deserialize)]
pub struct RegisterControllerRequest {
    pub name: String,
    #[serde(default = "default_controller_type")]
    pub controller_type: String,
}

fn default_controller_type() -> String {
    "Unknown".to_owned()
}

#[derive(Debug, Serialize)]
pub struct RegisterControllerResponse {
    pub id: Uuid,
    pub name: String,
    pub controller_type: String,
    /// Token the controller device presents when opening its WebSocket.
    pub auth_token: String,
}

/// POST /controllers - register a controller record.
pub async fn register_controller(
    State(state): State<AppState>,
    token: AuthToken,
    Json(request): Json<RegisterControllerRequest>,
) -> ApiResult<RegisterControllerResponse> {
    let record = state
        .register_controller(request.name, request.controller_type, token.0)
        .await;
    Ok(Json(RegisterControllerResponse {
        id: record.id,
        name: record.name,
        controller_type: record.controller_type,
        auth_token: record.auth_token,
    }))
}

/// GET /controllers/:id - controller summary including the connected flag.
pub async fn get_controller(
    State(state): State<AppState>,
    token: AuthToken,
    Path(controller_id): Path<Uuid>,
) -> ApiResult<ControllerSummary> {
    let summary = state
        .controller_summary(controller_id, token.as_str())
        .await?;
    Ok(Json(summary))
}

/// POST /controllers/:id/commands - validate a command envelope, apply it to
/// the lifecycle stores and forward the result to the live connection. The
/// 200 response means "accepted and forwarded", not "executed".
pub async fn send_command(
    State(state): State<AppState>,
    token: AuthToken,
    Path(controller_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> ApiResult<Value> {
    let request_id = request_id_from(&headers);
    debug!(controller = %controller_id, %request_id, "dispatching command");
    let ack = state
        .dispatch_command(controller_id, body, request_id, token.as_str())
        .await?;
    Ok(Json(ack))
}

/// GET /controllers/:id/messages - audit log, newest first.
pub async fn list_messages(
    State(state): State<AppState>,
    token: AuthToken,
    Path(controller_id): Path<Uuid>,
) -> ApiResult<Vec<MessageRecord>> {
    let messages = state.list_messages(controller_id, token.as_str()).await?;
    Ok(Json(messages))
}

// The request id normally comes from the tracing collaborator in front of
// us; generate one only as a fallback so correlation stays possible.
fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
