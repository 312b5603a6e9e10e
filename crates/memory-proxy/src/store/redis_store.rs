use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Deserialize;
use tracing::{debug, info};

use super::{decode_role, MessageStore};
use crate::models::Message;
use crate::utils::error::StoreError;

/// Message store backed by one Redis list per thread.
///
/// Each list entry is a JSON object `{"role": ..., "content": ...}`.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_prefix: String,
}

/// Shape of a list entry on read. `role` is optional so entries written by
/// older deployments still decode.
#[derive(Debug, Deserialize)]
struct StoredEntry {
    #[serde(default)]
    role: Option<String>,
    content: String,
}

/// Accept `host:port` as well as a full `redis://` / `rediss://` URL.
pub(crate) fn normalize_redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}", addr)
    }
}

impl RedisStore {
    /// Connect and PING. Fails fast when the server is unreachable.
    pub async fn connect(addr: &str, key_prefix: String) -> Result<Self, StoreError> {
        let url = normalize_redis_url(addr);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| StoreError::Connect(format!("invalid redis address {}: {}", addr, e)))?;

        // One-shot connection for the reachability check, so an unreachable
        // server is reported immediately instead of after reconnect backoff
        let mut probe = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connect(format!("redis at {}: {}", addr, e)))?;
        redis::cmd("PING")
            .query_async::<String>(&mut probe)
            .await
            .map_err(|e| StoreError::Connect(format!("redis ping at {}: {}", addr, e)))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connect(format!("redis at {}: {}", addr, e)))?;

        info!("Redis message store connected at {}", addr);
        Ok(Self { conn, key_prefix })
    }

    fn key(&self, thread_id: &str) -> String {
        format!("{}{}", self.key_prefix, thread_id)
    }
}

pub(crate) fn encode_entry(message: &Message) -> Result<String, StoreError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode one list entry. Bare strings (content-only history) get a
/// positional role.
pub(crate) fn decode_entry(thread_id: &str, position: usize, raw: &str) -> Message {
    match serde_json::from_str::<StoredEntry>(raw) {
        Ok(entry) => Message {
            role: decode_role(thread_id, position, entry.role.as_deref()),
            content: entry.content,
        },
        Err(_) => Message {
            role: decode_role(thread_id, position, None),
            content: raw.to_string(),
        },
    }
}

#[async_trait]
impl MessageStore for RedisStore {
    async fn save_message(&self, thread_id: &str, message: &Message) -> Result<(), StoreError> {
        let payload = encode_entry(message)?;
        let mut conn = self.conn.clone();
        let len: i64 = conn.rpush(self.key(thread_id), payload).await?;

        debug!(
            "Saved {} message to thread {} (length {})",
            message.role, thread_id, len
        );
        Ok(())
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(self.key(thread_id), 0, -1).await?;

        Ok(entries
            .iter()
            .enumerate()
            .map(|(position, raw)| decode_entry(thread_id, position, raw))
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
