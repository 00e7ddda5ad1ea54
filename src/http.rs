//! HTTP status reporter (distilled spec §6 "Status reporter (HTTP)"):
//! three read-mostly endpoints bound to `0.0.0.0:9999`, backed by the
//! shared [`GlobalControl`] and its status tree.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, extract::State, routing::get};

use crate::job::GlobalControl;
use crate::status::StatusSnapshot;

pub fn router(control: Arc<GlobalControl>) -> Router {
    Router::new()
        .route("/start_all", get(start_all))
        .route("/status_simple", get(status_simple))
        .route("/test_error", get(test_error))
        .with_state(control)
}

/// The deliberate error `/test_error` raises, to exercise the reporter's
/// error path (§6, §11) — mirrors the Python original's `/test_error`
/// route, which raises an exception that Flask turns into a 500.
#[derive(Debug, thiserror::Error)]
#[error("test_error endpoint invoked")]
struct TestError;

impl IntoResponse for TestError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

pub async fn serve(control: Arc<GlobalControl>) -> std::io::Result<()> {
    let app = router(control);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:9999").await?;
    tracing::info!("status reporter listening on 0.0.0.0:9999");
    axum::serve(listener, app).await
}

async fn start_all(State(control): State<Arc<GlobalControl>>) -> &'static str {
    let control = Arc::clone(&control);
    if control.is_running() {
        return "Already running";
    }
    tokio::spawn(async move {
        control.run_all().await;
    });
    "Started"
}

async fn status_simple(State(control): State<Arc<GlobalControl>>) -> Json<StatusSnapshot> {
    Json(control.status_tree().snapshot())
}

async fn test_error() -> Result<(), TestError> {
    Err(TestError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_maps_to_http_500() {
        let response = TestError.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
