//! HTTP routes next to the WebSocket endpoint.

use crate::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ratroom_core::{ClientList, OffChainMessage};
use serde_json::{Value, json};

/// Error returned by handlers. Logged in full, shown to callers as a
/// generic 500.
pub(crate) struct InternalError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for InternalError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for InternalError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self.0, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal server error" })),
        )
            .into_response()
    }
}

/// GET /test/ping
pub(crate) async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

/// GET /test/throw - fails on purpose so the error path can be checked
/// end to end.
pub(crate) async fn throw() -> Result<Json<Value>, InternalError> {
    Err(anyhow::anyhow!("deliberate failure from /test/throw").into())
}

/// GET /clients
pub(crate) async fn clients(State(state): State<AppState>) -> Result<Json<ClientList>, InternalError> {
    let clients = state.hub.list_active().await?;
    Ok(Json(ClientList { clients }))
}

/// GET /events/latest
pub(crate) async fn latest_events(
    State(state): State<AppState>,
) -> Result<Json<Vec<OffChainMessage>>, InternalError> {
    Ok(Json(state.hub.latest_events().await?))
}
