use axum::extract::FromRef;
use std::sync::Arc;

use crate::config::Settings;
use crate::services::{ConversationAssembler, PassthroughProxy, ResponseRelay, UpstreamClient};
use crate::store::MessageStore;
use crate::utils::error::ApiError;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub assembler: Arc<ConversationAssembler>,
    pub upstream: Arc<UpstreamClient>,
    pub relay: Arc<ResponseRelay>,
    pub passthrough: Arc<PassthroughProxy>,
}

impl AppState {
    /// Wire every service around an already opened store.
    pub fn new(settings: &Settings, store: Arc<dyn MessageStore>) -> Result<Self, ApiError> {
        Ok(Self {
            assembler: Arc::new(ConversationAssembler::new(store.clone())),
            upstream: Arc::new(UpstreamClient::new(&settings.upstream)?),
            relay: Arc::new(
                ResponseRelay::new(store.clone())
                    .with_max_line_bytes(settings.server.body_limit_bytes),
            ),
            passthrough: Arc::new(PassthroughProxy::new(
                &settings.upstream,
                settings.server.body_limit_bytes,
            )?),
            store,
        })
    }
}

impl FromRef<AppState> for Arc<dyn MessageStore> {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for Arc<PassthroughProxy> {
    fn from_ref(state: &AppState) -> Self {
        state.passthrough.clone()
    }
}
