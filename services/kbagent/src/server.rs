//! Request/response HTTP server.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kbagent_proto::{ActionError, ActionRequest, ActionResponse, ACTION_URI};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::action::ActionService;

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    actions: Arc<ActionService>,
    /// Bounds concurrent action calls.
    permits: Semaphore,
}

impl AppState {
    pub fn new(actions: Arc<ActionService>, max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                actions,
                permits: Semaphore::new(max_concurrency.max(1)),
            }),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(ACTION_URI, post(call_action))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

async fn call_action(State(state): State<AppState>, body: Bytes) -> Response {
    let request: ActionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return failure(&ActionError::bad_request(format!(
                "invalid action request: {e}"
            )))
        }
    };

    let Ok(_permit) = state.inner.permits.try_acquire() else {
        return failure(&ActionError::busy("too many concurrent action calls"));
    };

    match state.inner.actions.handle_request(&request).await {
        Ok(output) => (StatusCode::OK, Json(ActionResponse::success(output))).into_response(),
        Err(err) => {
            debug!(action = %request.action, error = %err, "action call failed");
            failure(&err)
        }
    }
}

fn failure(err: &ActionError) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ActionResponse::failure(err)),
    )
        .into_response()
}
