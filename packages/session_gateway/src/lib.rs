//! HTTP gateway over the session manager.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use session_manager::SessionManager;
use std::time::Instant;

pub mod config;
pub mod error;
pub mod handlers;
pub mod loopback;
#[cfg(test)]
mod test_helpers;

#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: SessionManager) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}

/// All gateway routes, without tracing or CORS layers.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/api/instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/api/instances/{id}",
            axum::routing::delete(handlers::delete_instance),
        )
        .route(
            "/api/instances/{id}/restart",
            post(handlers::restart_instance),
        )
        .route("/api/instances/{id}/status", get(handlers::get_status))
        .route("/api/instances/{id}/logout", post(handlers::logout_instance))
        .route("/api/instances/{id}/messages", post(handlers::send_message))
        .route("/api/instances/{id}/receipts", post(handlers::send_receipts))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_router_wires_api_routes() {
        let (state, _engine, _tmp) = test_helpers::test_app_state();
        let app = router(state, 1024 * 1024);

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/instances")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/instances/ghost/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_body_limit_is_enforced() {
        let (state, _engine, _tmp) = test_helpers::test_app_state();
        let app = router(state, 64);

        let body = serde_json::json!({
            "number": "51988777666",
            "type": "media",
            "media": "A".repeat(256),
            "filename": "big.png",
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/instances/dev1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
