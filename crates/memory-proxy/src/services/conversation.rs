use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{Message, ResponsesRequest, ThreadId};
use crate::store::MessageStore;
use crate::utils::error::ApiError;

/// Everything the forwarder needs for one upstream call.
#[derive(Debug, Clone)]
pub struct PreparedConversation {
    pub thread_id: ThreadId,
    pub model: String,
    pub messages: Vec<Message>,
    pub stream: bool,
}

/// Turns an incoming turn plus stored history into the upstream message list.
///
/// The store is the single source of truth: new turns are persisted first,
/// then the whole thread is read back.
#[derive(Clone)]
pub struct ConversationAssembler {
    store: Arc<dyn MessageStore>,
}

impl ConversationAssembler {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn prepare(&self, request: ResponsesRequest) -> Result<PreparedConversation, ApiError> {
        validate(&request)?;

        let thread_id = match request.thread_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                info!("No thread_id supplied, started thread {}", id);
                id
            }
        };

        for message in &request.messages {
            self.store.save_message(&thread_id, message).await?;
        }

        let messages = self.store.get_messages(&thread_id).await?;
        if messages.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "thread {} has no messages to send",
                thread_id
            )));
        }

        debug!(
            "Thread {}: {} new, {} total messages",
            thread_id,
            request.messages.len(),
            messages.len()
        );

        Ok(PreparedConversation {
            thread_id,
            model: request.model,
            messages,
            stream: request.stream,
        })
    }
}

fn validate(request: &ResponsesRequest) -> Result<(), ApiError> {
    if request.model.trim().is_empty() {
        return Err(ApiError::BadRequest("model is required".to_string()));
    }

    if let Some(idx) = request.messages.iter().position(|m| m.content.is_empty()) {
        return Err(ApiError::BadRequest(format!(
            "messages[{}].content must not be empty",
            idx
        )));
    }

    Ok(())
}
