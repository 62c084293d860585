use crate::models::ErrorResponse;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::Value;
use shared::Error;
use tracing::{info, warn};

/// POST /bus/:address
///
/// Delivers the JSON body to the handler at `address` and answers with its
/// reply. A handler that chose not to reply yields 204.
pub async fn send_envelope(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    info!("POST /bus/{}", address);

    match state
        .bus
        .request_timeout(&address, body, state.reply_timeout)
        .await
    {
        Ok(reply) => (StatusCode::OK, Json(reply)).into_response(),
        Err(Error::NoReply(_)) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ Error::NoHandler(_)) => failure(StatusCode::NOT_FOUND, &e),
        Err(e @ Error::ReplyTimeout { .. }) => failure(StatusCode::GATEWAY_TIMEOUT, &e),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

fn failure(status: StatusCode, error: &Error) -> Response {
    warn!("Bus request failed with {}: {}", status, error);
    (status, Json(ErrorResponse::new(error.to_string()))).into_response()
}
