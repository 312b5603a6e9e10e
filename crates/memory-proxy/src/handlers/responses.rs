use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};

use crate::models::ResponsesRequest;
use crate::services::RelayMode;
use crate::state::AppState;
use crate::utils::error::ApiError;

/// `POST /v1/responses`: record the turn, call upstream with the whole
/// thread, relay the answer and record the reply.
pub async fn responses_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let start_time = Instant::now();

    // Parsed by hand so malformed JSON is a plain-text 400, not a 422
    let request: ResponsesRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!("Failed to decode request: {}", e);
        ApiError::BadRequest(format!("invalid request body: {}", e))
    })?;

    let conversation = state.assembler.prepare(request).await?;
    let mode = RelayMode::for_request(conversation.stream);

    info!(
        "Conversation request: thread={}, model={}, messages={}, mode={:?}",
        conversation.thread_id,
        conversation.model,
        conversation.messages.len(),
        mode
    );

    let upstream = state.upstream.send(&conversation, &headers).await?;
    let response = state
        .relay
        .relay(mode, conversation.thread_id, upstream)
        .await?;

    info!(
        "Upstream answered {} in {}ms",
        response.status(),
        start_time.elapsed().as_millis()
    );
    Ok(response)
}
