use axum::{extract::{Request, State}, response::Response};
use std::sync::Arc;

use crate::services::PassthroughProxy;
use crate::utils::error::ApiError;

/// Fallback for every path without memory semantics.
pub async fn passthrough_handler(
    State(proxy): State<Arc<PassthroughProxy>>,
    request: Request,
) -> Result<Response, ApiError> {
    proxy.forward(request).await
}
