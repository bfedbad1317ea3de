//! API Routes
//!
//! - `POST /api/chat` - Ask a question about the session's flight log
//! - `POST /api/sessions/{id}/flight-data` - Load parsed flight messages
//! - `GET /api/sessions/{id}/history` - Conversation history
//! - `DELETE /api/sessions/{id}` - End a session
//! - `GET /api/health` - Health check

pub mod chat;
pub mod health;
pub mod sessions;

use axum::http::StatusCode;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;
use crate::store::StoreError;
use crate::types::AppError;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    info!("Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(chat::router(state.clone()))
        .merge(sessions::router(state.clone()))
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// HTTP status for errors that are reported to the caller directly.
pub fn status_for(err: &AppError) -> StatusCode {
    match err {
        AppError::SessionBusy(_) => StatusCode::CONFLICT,
        AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        AppError::CapacityReached(_) => StatusCode::SERVICE_UNAVAILABLE,
        AppError::InvalidRequest(_) | AppError::Store(StoreError::InvalidData(_)) => StatusCode::BAD_REQUEST,
        AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        AppError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        AppError::Store(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&AppError::SessionBusy("a".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&AppError::SessionNotFound("a".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&AppError::CapacityReached(3)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status_for(&AppError::Store(StoreError::InvalidData("empty".into()))),
            StatusCode::BAD_REQUEST
        );
    }
}
