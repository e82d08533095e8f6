//! HTTP surface
//!
//! Binds loopback only and exposes the Anthropic-shaped endpoints the coding
//! agent talks to: `/v1/messages`, `/v1/messages/count_tokens`, `/health`,
//! and a status snapshot on `/`.

use crate::router::Router as ModelRouter;
use crate::tokens::estimate_tokens;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use claudish_core::anthropic::MessagesRequest;
use claudish_core::GatewayError;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub port: u16,
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_snapshot))
        .route("/health", get(health_check))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(count_tokens))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn status_snapshot(State(state): State<AppState>) -> Json<serde_json::Value> {
    let sessions: serde_json::Map<String, serde_json::Value> = state
        .router
        .usage_snapshots()
        .into_iter()
        .filter_map(|(key, snap)| Some((key, serde_json::to_value(snap).ok()?)))
        .collect();

    Json(serde_json::json!({
        "service": "claudish",
        "port": state.port,
        "sessions": sessions,
    }))
}

/// Wrapper giving [`GatewayError`] an Anthropic-shaped HTTP rendering.
struct ApiError(GatewayError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "type": "error",
            "error": {
                "type": self.0.error_type(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

async fn handle_messages(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: MessagesRequest = serde_json::from_slice(&body).map_err(|e| {
        ApiError(GatewayError::Api {
            status: 400,
            message: format!("invalid messages request: {}", e),
        })
    })?;

    info!(
        "{} {} ({} messages, stream={})",
        request.model,
        state.router.target_for(&request.model),
        request.messages.len(),
        request.stream.unwrap_or(false)
    );

    let handler = state.router.handler_for(&request.model);
    handler.handle(request, body).await.map_err(|e| {
        error!("request failed: {}", e);
        ApiError(e)
    })
}

/// Anthropic-native requests pass through; every other backend gets the
/// 4-bytes-per-token estimate.
async fn count_tokens(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    // count_tokens bodies omit max_tokens; only the model matters here.
    let model = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("model").and_then(|m| m.as_str()).map(str::to_string))
        .ok_or_else(|| {
            ApiError(GatewayError::Api {
                status: 400,
                message: "count_tokens request has no model".into(),
            })
        })?;

    let handler = state.router.handler_for(&model);
    if handler.is_anthropic_native() {
        return handler
            .count_tokens_passthrough(body)
            .await
            .map_err(ApiError);
    }

    Ok(Json(serde_json::json!({
        "input_tokens": estimate_tokens(body.len()),
    }))
    .into_response())
}
