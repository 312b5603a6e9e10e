//! Durable, ordered message log per thread.
//!
//! Two backends share one capability set:
//! - [`SqliteStore`]: a single local SQLite file (sqlx)
//! - [`RedisStore`]: one append-only Redis list per thread
//!
//! The backend is chosen once at startup from [`StorageConfig`].

mod redis_store;
mod sqlite_store;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{StorageBackend, StorageConfig};
use crate::models::{Message, Role};
use crate::utils::error::StoreError;

pub use redis_store::RedisStore;
pub use sqlite_store::SqliteStore;

/// Storage port used by the conversation pipeline.
///
/// Implementations must keep insertion order per thread and be safe to share
/// across concurrent requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message to the tail of `thread_id`.
    async fn save_message(&self, thread_id: &str, message: &Message) -> Result<(), StoreError>;

    /// Full history of `thread_id` in insertion order. Unknown threads are empty.
    async fn get_messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError>;

    /// Reachability check for readiness probes
    async fn ping(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Open the configured backend. Any failure here is fatal at startup.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn MessageStore>, StoreError> {
    let store: Arc<dyn MessageStore> = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::open(&config.sqlite_path).await?),
        StorageBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis_url, config.redis_key_prefix.clone()).await?,
        ),
    };

    info!("Message store ready: backend={}", store.backend_name());
    Ok(store)
}

/// Role of a stored entry that carries none, inferred from its position.
///
/// Compatibility shim for history written as bare content strings: roles
/// strictly alternate starting at `user`. Entries written by this service
/// always carry their role and never go through here.
pub fn fallback_role(position: usize) -> Role {
    if position % 2 == 0 {
        Role::User
    } else {
        Role::Assistant
    }
}

/// Build a message from a raw role column/field, falling back to
/// positional alternation when the role is missing or unrecognised.
pub(crate) fn decode_role(thread_id: &str, position: usize, raw: Option<&str>) -> Role {
    match raw.map(str::parse::<Role>) {
        Some(Ok(role)) => role,
        Some(Err(_)) | None => {
            let role = fallback_role(position);
            warn!(
                "Thread {} entry {} has no usable role ({:?}), assuming {}",
                thread_id, position, raw, role
            );
            role
        }
    }
}
