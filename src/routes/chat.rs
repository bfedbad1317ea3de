use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use tracing::{info, warn};

use crate::models::{AppState, ChatRequest, ChatResponse};
use crate::orchestrator::GENERIC_ERROR_REPLY;
use crate::routes::status_for;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(post_chat))
        .with_state(state)
}

/// Always answers with `{message, sessionId, error?}`. Pipeline failures come
/// back as 200 with `error` set; only session problems and empty messages
/// change the status. Server-side failures carry the generic reply, never
/// the error detail.
pub async fn post_chat(State(state): State<AppState>, Json(request): Json<ChatRequest>) -> impl IntoResponse {
    info!(
        session_id = ?request.session_id,
        message_len = request.message.len(),
        has_flight_data = request.flight_data.is_some(),
        "Received chat request"
    );

    match state
        .orchestrator
        .handle(&request.message, request.session_id.as_deref(), request.flight_data.as_ref())
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => {
            warn!(error = %err, "Chat request refused");
            let status = status_for(&err);
            let message = if status.is_server_error() {
                GENERIC_ERROR_REPLY.to_string()
            } else {
                err.to_string()
            };
            (
                status,
                Json(ChatResponse {
                    message,
                    session_id: request.session_id.unwrap_or_default(),
                    error: Some(err.code().to_string()),
                }),
            )
        }
    }
}
