mod controllers;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;

use crate::state::{AppState, StateError};
use crate::websocket::websocket_handler;

pub use crate::auth::AuthToken;
pub use controllers::*;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/controllers", post(register_controller))
        .route("/controllers/:id", get(get_controller))
        .route("/controllers/:id/commands", post(send_command))
        .route("/controllers/:id/messages", get(list_messages))
        .route("/ws/controllers/:id", get(websocket_handler))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    NotConnected(&'static str),
    Validation(String),
    Conflict(&'static str),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl From<StateError> for ApiError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::ControllerNotFound => ApiError::NotFound("unknown controller"),
            StateError::Forbidden => ApiError::Forbidden("not authorized for controller"),
            StateError::NotConnected => ApiError::NotConnected("controller channel not set"),
            StateError::Validation(message) => ApiError::Validation(message),
            StateError::DuplicateMessage => ApiError::Conflict("duplicate message"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized => (
                axum::http::StatusCode::UNAUTHORIZED,
                Json(ApiErrorBody {
                    error: "unauthorized",
                    message: None,
                }),
            )
                .into_response(),
            ApiError::Forbidden(msg) => (
                axum::http::StatusCode::FORBIDDEN,
                Json(ApiErrorBody {
                    error: "forbidden",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                Json(ApiErrorBody {
                    error: "not_found",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            // Distinct from a validation failure so callers can tell "bad
            // request" from "try again once the controller reconnects".
            ApiError::NotConnected(msg) => (
                axum::http::StatusCode::CONFLICT,
                Json(ApiErrorBody {
                    error: "not_connected",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
            ApiError::Validation(msg) => (
                axum::http::StatusCode::BAD_REQUEST,
                Json(json!({ "message": [msg] })),
            )
                .into_response(),
            ApiError::Conflict(msg) => (
                axum::http::StatusCode::CONFLICT,
                Json(ApiErrorBody {
                    error: "conflict",
                    message: Some(msg.to_string()),
                }),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ControllerSummary;
    use axum::{
        body::{self, Body},
        http::{Request, StatusCode},
    };
    use channel_bus::{Bus, LocalBus};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn command_flow_over_http() {
        let bus = Arc::new(LocalBus::new());
        let state = AppState::new(bus.clone());
        let app = build_router(state.clone());

        let (status, created) = send(
            &app,
            "POST",
            "/controllers",
            Some("owner-token"),
            Some(json!({"name": "main bed", "controller_type": "ESP32"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let controller_id: uuid::Uuid =
            serde_json::from_value(created["id"].clone()).unwrap();

        // Not yet connected: distinct from a validation failure.
        let (status, body) = send(
            &app,
            "POST",
            &format!("/controllers/{controller_id}/commands"),
            Some("owner-token"),
            Some(json!({"type": "cmd"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_connected");

        let (_, mut delivery) = state.connect_controller(controller_id).await.unwrap();

        let peripheral_id = uuid::Uuid::new_v4();
        let (status, ack) = send(
            &app,
            "POST",
            &format!("/controllers/{controller_id}/commands"),
            Some("owner-token"),
            Some(json!({
                "type": "cmd",
                "peripheral": {
                    "add": [{
                        "uuid": peripheral_id.to_string(),
                        "type": "BME280",
                        "name": "temp",
                        "pin": 4
                    }]
                }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["type"], "cmd");
        assert_eq!(ack["peripheral"]["add"][0]["uuid"], peripheral_id.to_string());
        assert!(!ack["request_id"].as_str().unwrap().is_empty());

        let delivered: Value =
            serde_json::from_slice(&delivery.recv().await.unwrap().payload).unwrap();
        assert_eq!(delivered["type"], "send.peripheral.commands");

        let (status, summary) = send(
            &app,
            "GET",
            &format!("/controllers/{controller_id}"),
            Some("owner-token"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let summary: ControllerSummary = serde_json::from_value(summary).unwrap();
        assert!(summary.connected);
        assert_eq!(summary.peripherals, 1);

        let (status, messages) = send(
            &app,
            "GET",
            &format!("/controllers/{controller_id}/messages"),
            Some("owner-token"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn validation_failure_returns_reason_list() {
        let state = AppState::new(Arc::new(LocalBus::new()));
        let app = build_router(state.clone());

        let (_, created) = send(
            &app,
            "POST",
            "/controllers",
            Some("owner-token"),
            Some(json!({"name": "bed", "controller_type": "ESP32"})),
        )
        .await;
        let controller_id: uuid::Uuid =
            serde_json::from_value(created["id"].clone()).unwrap();
        state.connect_controller(controller_id).await.unwrap();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/controllers/{controller_id}/commands"),
            Some("owner-token"),
            Some(json!({
                "type": "cmd",
                "peripheral": {"add": [{"uuid": uuid::Uuid::new_v4().to_string(), "name": "no type"}]}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let reasons = body["message"].as_array().unwrap();
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].as_str().unwrap().contains("type"));
    }

    #[tokio::test]
    async fn auth_and_lookup_failures() {
        let state = AppState::new(Arc::new(LocalBus::new()));
        let app = build_router(state.clone());

        let (status, _) = send(&app, "POST", "/controllers", None, Some(json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &app,
            "GET",
            &format!("/controllers/{}", uuid::Uuid::new_v4()),
            Some("anyone"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, created) = send(
            &app,
            "POST",
            "/controllers",
            Some("owner-token"),
            Some(json!({"name": "bed", "controller_type": "ESP32"})),
        )
        .await;
        let controller_id = created["id"].as_str().unwrap().to_owned();
        let (status, body) = send(
            &app,
            "GET",
            &format!("/controllers/{controller_id}"),
            Some("intruder"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");
    }

    #[tokio::test]
    async fn request_id_header_is_echoed() {
        let state = AppState::new(Arc::new(LocalBus::new()));
        let app = build_router(state.clone());

        let (_, created) = send(
            &app,
            "POST",
            "/controllers",
            Some("owner-token"),
            Some(json!({"name": "bed", "controller_type": "ESP32"})),
        )
        .await;
        let controller_id: uuid::Uuid =
            serde_json::from_value(created["id"].clone()).unwrap();
        state.connect_controller(controller_id).await.unwrap();

        let request = Request::builder()
            .method("POST")
            .uri(format!("/controllers/{controller_id}/commands"))
            .header("authorization", "Bearer owner-token")
            .header("content-type", "application/json")
            .header("x-request-id", "trace-42")
            .body(Body::from(json!({"type": "cmd"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let ack: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack["request_id"], "trace-42");
    }

    #[tokio::test]
    async fn bus_subscribe_does_not_leak_across_controllers() {
        let bus: Arc<LocalBus> = Arc::new(LocalBus::new());
        let state = AppState::new(bus.clone());
        let app = build_router(state.clone());

        let (_, created) = send(
            &app,
            "POST",
            "/controllers",
            Some("owner-token"),
            Some(json!({"name": "bed", "controller_type": "ESP32"})),
        )
        .await;
        let controller_id: uuid::Uuid =
            serde_json::from_value(created["id"].clone()).unwrap();
        let (channel, _receiver) = state.connect_controller(controller_id).await.unwrap();

        let mut other = bus.subscribe("some-other-channel");
        send(
            &app,
            "POST",
            &format!("/controllers/{controller_id}/commands"),
            Some("owner-token"),
            Some(json!({
                "type": "cmd",
                "task": {"add": [{"uuid": uuid::Uuid::new_v4().to_string(), "type": "SetLight", "name": "l"}]}
            })),
        )
        .await;
        assert!(other.try_recv().is_err());

        let mut ours = bus.subscribe(&channel);
        assert!(ours.try_recv().is_err());
    }
}
