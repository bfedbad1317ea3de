use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use tracing::{info, warn};

use crate::models::{AppState, ErrorResponse, HistoryResponse, IngestResponse};
use crate::routes::status_for;
use crate::store::FlightMessages;
use crate::types::AppError;

/// Parsed flight logs are large; the default 2 MB body limit is too small.
const MAX_FLIGHT_DATA_BYTES: usize = 256 * 1024 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions/{id}", delete(end_session))
        .route("/api/sessions/{id}/history", get(get_history))
        .route(
            "/api/sessions/{id}/flight-data",
            post(upload_flight_data).layer(DefaultBodyLimit::max(MAX_FLIGHT_DATA_BYTES)),
        )
        .with_state(state)
}

fn error_response(err: AppError) -> Response {
    warn!(error = %err, "Session request failed");
    let status = status_for(&err);
    let body = ErrorResponse {
        error: err.code().to_string(),
        message: if status.is_server_error() {
            "Internal error".to_string()
        } else {
            err.to_string()
        },
    };
    (status, Json(body)).into_response()
}

async fn get_history(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.sessions().existing(&id).await {
        Ok(session) => Json(HistoryResponse {
            session_id: session.id.clone(),
            created_at: session.created_at,
            exchanges: session.exchanges().to_vec(),
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn end_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.sessions().end_session(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

/// Load parsed messages (`{message_name: {field: [values...]}}`) into the
/// session's tables, creating the session when it does not exist yet.
async fn upload_flight_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(messages): Json<FlightMessages>,
) -> Response {
    let session = match state.orchestrator.sessions().acquire(Some(&id)).await {
        Ok(session) => session,
        Err(err) => return error_response(err),
    };

    match session.store().load_messages(&messages).await {
        Ok(summary) => {
            info!(session_id = %session.id, "Flight data uploaded");
            (
                StatusCode::CREATED,
                Json(IngestResponse {
                    session_id: session.id.clone(),
                    tables: summary.tables,
                    rows_inserted: summary.rows_inserted,
                }),
            )
                .into_response()
        }
        Err(err) => error_response(AppError::from(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_messages, test_state, ScriptedLLM, ScriptedSandbox};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn upload(id: &str, body: Value) -> Request<Body> {
        Request::post(format!("/api/sessions/{id}/flight-data"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_upload_history_and_end() {
        let scripted = ScriptedLLM::new(vec![Ok("NONE".to_string())]);
        let state = test_state(&scripted, &ScriptedSandbox::default());
        let app = router(state.clone());

        let payload = serde_json::to_value(sample_messages()).unwrap();
        let (status, body) = send(app.clone(), upload("flight-9", payload)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["sessionId"], "flight-9");
        assert_eq!(body["rowsInserted"], 13);

        state.orchestrator.handle("hello there", Some("flight-9"), None).await.unwrap();

        let (status, body) = send(
            app.clone(),
            Request::get("/api/sessions/flight-9/history").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["exchanges"].as_array().unwrap().len(), 2);
        assert_eq!(body["exchanges"][0]["role"], "user");

        let (status, _) = send(
            app.clone(),
            Request::delete("/api/sessions/flight-9").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            app,
            Request::get("/api/sessions/flight-9/history").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn test_empty_upload_is_rejected() {
        let scripted = ScriptedLLM::new(vec![]);
        let app = router(test_state(&scripted, &ScriptedSandbox::default()));

        let (status, body) = send(app, upload("flight-10", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_flight_data");
    }

    #[tokio::test]
    async fn test_unknown_session_delete() {
        let scripted = ScriptedLLM::new(vec![]);
        let app = router(test_state(&scripted, &ScriptedSandbox::default()));

        let (status, _) = send(app, Request::delete("/api/sessions/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
