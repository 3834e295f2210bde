//! HTTP Router: endpoint dispatch, request validation, JSON/HTML replies.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequest, Path, RawQuery, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::constants::{HTTP_READ_TIMEOUT, MAX_BODY_SIZE, SERVICE_IDENTIFIER};
use crate::error::ClawkerError;
use crate::session::{CallbackChannel, SessionStore};

use super::handlers;
use super::listeners::DynamicListeners;

/// Shared state every handler closes over.
#[derive(Clone)]
pub struct AppState {
    pub callback: Arc<CallbackChannel>,
    pub store: Arc<SessionStore>,
    pub listeners: Arc<DynamicListeners>,
}

/// Wraps a `ClawkerError` so it can be returned directly from an axum
/// handler; maps the error kind to a status code and the universal
/// `{"success":false,"error":"..."}` JSON envelope.
#[derive(Debug)]
pub struct ApiError(pub ClawkerError);

impl From<ClawkerError> for ApiError {
    fn from(e: ClawkerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({ "success": false, "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Drop-in replacement for `axum::Json` on request bodies: a rejection
/// (malformed JSON, wrong content-type, missing body) becomes the spec's
/// `400` + `{"success":false,"error":"invalid JSON request body"}`
/// envelope instead of axum's default plain-text rejection.
pub struct ValidJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(_) => Err(ApiError(ClawkerError::validation("invalid JSON request body"))),
        }
    }
}

/// Wraps a successful JSON payload, merging in `"success": true`.
pub fn ok_json(mut payload: Value) -> Json<Value> {
    if let Value::Object(ref mut map) = payload {
        map.insert("success".to_string(), json!(true));
    }
    Json(payload)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": SERVICE_IDENTIFIER }))
}

/// Builds the main host proxy router: open/url, git/credential, ssh/agent,
/// gpg/agent, health, and the callback channel surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/open/url", post(handlers::open_url))
        .route("/git/credential", post(handlers::git_credential))
        .route("/ssh/agent", post(handlers::ssh_agent))
        .route("/gpg/agent", post(handlers::gpg_agent))
        .route("/callback/register", post(handlers::register_callback))
        .route("/callback/{session_id}/data", get(handlers::callback_data))
        .route("/callback/{session_id}", delete(handlers::delete_callback))
        .route("/cb/{session_id}/{*rest}", get(browser_cb))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    HTTP_READ_TIMEOUT,
                )),
        )
}

/// `GET /cb/{session_id}/...` is a fixed-path alternative to a dynamic
/// per-port listener, for OAuth providers that require a stable
/// pre-registered redirect URI. Browser-facing: captures the request the
/// same way the dynamic listener does and renders an HTML page.
async fn browser_cb(
    State(state): State<AppState>,
    Path((session_id, rest)): Path<(String, String)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Html<String> {
    handlers::handle_browser_callback(
        &state.callback,
        &session_id,
        "GET",
        &format!("/cb/{session_id}/{rest}"),
        query.unwrap_or_default(),
        headers,
        Vec::new(),
    )
    .await
}
