use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, error};

use crate::config::UpstreamConfig;
use crate::models::chat::ChatCompletionRequest;
use crate::services::conversation::PreparedConversation;
use crate::utils::error::ApiError;

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Headers describing the inbound connection or body framing. They are
/// recomputed for the outbound request and never copied.
const HOP_BY_HOP: [&str; 10] = [
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
    "te",
    "trailer",
    "proxy-authorization",
    "proxy-connection",
];

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Step one of the header contract: copy every caller header except
/// hop-by-hop ones and `accept-encoding` (the relay must read plain text).
pub fn copy_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut outbound = HeaderMap::with_capacity(inbound.len());
    for (name, value) in inbound {
        if is_hop_by_hop(name) || *name == header::ACCEPT_ENCODING {
            continue;
        }
        outbound.append(name.clone(), value.clone());
    }
    outbound
}

/// Step two: set the bearer credential only when the copy left
/// `Authorization` empty. Caller-supplied auth is never replaced.
pub fn inject_credential(headers: &mut HeaderMap, api_key: Option<&str>) {
    let has_auth = headers
        .get(header::AUTHORIZATION)
        .is_some_and(|value| !value.is_empty());
    if has_auth {
        return;
    }

    let Some(key) = api_key else {
        return;
    };

    match HeaderValue::from_str(&format!("Bearer {}", key)) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(header::AUTHORIZATION, value);
        }
        Err(e) => error!("Configured upstream API key is not a valid header value: {}", e),
    }
}

/// Client for the provider's chat completion endpoint.
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .build()
            .map_err(|e| ApiError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn completions_url(&self) -> String {
        format!("{}{}", self.base_url, CHAT_COMPLETIONS_PATH)
    }

    /// Outbound headers for a caller request: copy, then inject if absent.
    pub fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = copy_request_headers(inbound);
        inject_credential(&mut headers, self.api_key.as_deref());
        if !headers.contains_key(header::CONTENT_TYPE) {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        headers
    }

    /// Issue the single upstream attempt for a prepared conversation.
    ///
    /// Any HTTP status is returned to the relay as-is; only transport
    /// failures become errors (502).
    pub async fn send(
        &self,
        conversation: &PreparedConversation,
        inbound_headers: &HeaderMap,
    ) -> Result<reqwest::Response, ApiError> {
        let payload = serde_json::to_vec(&ChatCompletionRequest {
            model: &conversation.model,
            messages: &conversation.messages,
            stream: conversation.stream,
        })
        .map_err(|e| ApiError::Internal(format!("Failed to encode upstream payload: {}", e)))?;

        debug!(
            "Forwarding thread {} ({} messages, stream={}) to {}",
            conversation.thread_id,
            conversation.messages.len(),
            conversation.stream,
            self.completions_url()
        );

        let response = self
            .client
            .post(self.completions_url())
            .headers(self.outbound_headers(inbound_headers))
            .body(payload)
            .send()
            .await
            .map_err(|e| ApiError::Upstream(format!("Failed to call upstream API: {}", e)))?;

        debug!(
            "Upstream answered {} for thread {}",
            response.status(),
            conversation.thread_id
        );
        Ok(response)
    }
}
