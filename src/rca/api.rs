use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::lifecycle::SessionLifecycle;
use super::models::AlertGroup;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub lifecycle: SessionLifecycle,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(lifecycle: SessionLifecycle) -> SharedState {
        Arc::new(Self { lifecycle })
    }
}

// ── Response payload types ────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PendingResponse {
    pub pending: usize,
}

// ── Error type ────────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/alerts", post(submit_alert))
        .route("/api/sessions/pending", get(pending_sessions))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Park an alert group and hand back the token to stream it with.
async fn submit_alert(
    State(state): State<SharedState>,
    Json(alert): Json<AlertGroup>,
) -> Result<impl IntoResponse, ApiError> {
    alert.validate().map_err(ApiError::BadRequest)?;
    let services = alert.affected_services();
    let session_id = state.lifecycle.store().create(alert);
    tracing::info!(session_id = %session_id, services = ?services, "alert submitted");
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { session_id })))
}

async fn pending_sessions(State(state): State<SharedState>) -> Json<PendingResponse> {
    Json(PendingResponse {
        pending: state.lifecycle.store().pending(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::rca::capability::CapabilitySet;
    use crate::rca::models::fixtures::checkout_alert;
    use crate::rca::pipeline::{Orchestrator, PipelineOptions};
    use crate::rca::session::SessionStore;

    fn test_state() -> SharedState {
        AppState::new(SessionLifecycle::new(
            Arc::new(SessionStore::new()),
            Orchestrator::new(CapabilitySet::scripted(), PipelineOptions::default()),
        ))
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app(test_state());
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_submit_alert_returns_session_id() {
        let state = test_state();
        let app = test_app(state.clone());
        let payload = serde_json::to_value(checkout_alert()).unwrap();

        let response = app.oneshot(post_json("/alerts", payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body: SubmitResponse = body_json(response.into_body()).await;
        assert!(uuid::Uuid::parse_str(&body.session_id).is_ok());
        assert!(state.lifecycle.store().contains(&body.session_id));
    }

    #[tokio::test]
    async fn test_submit_rejects_non_numeric_version() {
        let state = test_state();
        let app = test_app(state.clone());
        let mut payload = serde_json::to_value(checkout_alert()).unwrap();
        payload["version"] = serde_json::json!("v4");

        let response = app.oneshot(post_json("/alerts", payload)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("v4"));
        assert_eq!(state.lifecycle.store().pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_malformed_body() {
        let app = test_app(test_state());
        let response = app
            .oneshot(post_json("/alerts", serde_json::json!({"alerts": "nope"})))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_pending_counts_unclaimed_sessions() {
        let state = test_state();
        state.lifecycle.store().create(checkout_alert());
        let claimed = state.lifecycle.store().create(checkout_alert());
        state.lifecycle.store().take(&claimed).unwrap();

        let request = Request::builder()
            .uri("/api/sessions/pending")
            .body(Body::empty())
            .unwrap();
        let response = test_app(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: PendingResponse = body_json(response.into_body()).await;
        assert_eq!(body.pending, 1);
    }
}
