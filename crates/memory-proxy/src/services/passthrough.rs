use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, Uri},
    response::Response,
};
use reqwest::{redirect, Client};
use std::time::Duration;
use tracing::{debug, error};

use crate::config::UpstreamConfig;
use crate::services::upstream::is_hop_by_hop;
use crate::utils::error::ApiError;

/// Forwards non-conversation paths to the upstream host unmodified.
///
/// No memory interaction and no credential injection: whatever the caller
/// sends is what upstream sees.
#[derive(Clone)]
pub struct PassthroughProxy {
    client: Client,
    base_url: String,
    body_limit: usize,
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

impl PassthroughProxy {
    pub fn new(config: &UpstreamConfig, body_limit: usize) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            // Redirects belong to the caller
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            body_limit,
        })
    }

    pub fn target_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.base_url, path_and_query)
    }

    pub async fn forward(&self, request: Request) -> Result<Response, ApiError> {
        let (parts, body) = request.into_parts();
        let target = self.target_url(&parts.uri);

        // Request bodies are buffered so upstream gets an exact Content-Length;
        // responses are streamed back as they arrive
        let body = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))?;

        debug!(
            "Proxying {} {} to {} ({} byte body)",
            parts.method,
            parts.uri,
            target,
            body.len()
        );

        let mut outbound = self
            .client
            .request(parts.method, &target)
            .headers(strip_hop_by_hop(&parts.headers));
        if !body.is_empty() {
            outbound = outbound.body(body);
        }

        let upstream = outbound
            .send()
            .await
            .map_err(|e| {
                error!("Passthrough request to {} failed: {}", target, e);
                ApiError::Upstream(format!("Failed to reach upstream: {}", e))
            })?;

        let status = upstream.status();
        let headers = strip_hop_by_hop(upstream.headers());

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}
