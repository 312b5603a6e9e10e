use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{decode_role, MessageStore};
use crate::models::Message;
use crate::utils::error::StoreError;

const CREATE_MESSAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    thread TEXT NOT NULL,
    role TEXT,
    content TEXT NOT NULL,
    created_at INTEGER NOT NULL
)"#;

const ADD_ROLE_COLUMN: &str = "ALTER TABLE messages ADD COLUMN role TEXT";

const REQUIRED_COLUMNS: [&str; 4] = ["id", "thread", "content", "created_at"];

const CREATE_THREAD_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages (thread, id)";

#[derive(Debug, FromRow)]
struct MessageRow {
    role: Option<String>,
    content: String,
}

/// Message store backed by a single SQLite file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database file and make sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connect(format!(
                    "creating database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connect(format!("opening {}: {}", path.display(), e)))?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!("SQLite message store opened at {}", path.display());
        Ok(store)
    }

    /// Private in-memory database (tests).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        // A single connection: every pooled connection would get its own memory DB
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_MESSAGES_TABLE)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;

        // Files written before roles were stored lack the `role` column
        let columns: Vec<String> =
            sqlx::query_scalar("SELECT name FROM pragma_table_info('messages')")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::Schema)?;

        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|required| !columns.iter().any(|c| c == required))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::IncompatibleSchema(format!(
                "missing column(s) {}",
                missing.join(", ")
            )));
        }

        if !columns.iter().any(|c| c == "role") {
            sqlx::query(ADD_ROLE_COLUMN)
                .execute(&self.pool)
                .await
                .map_err(StoreError::Schema)?;
            info!("Added role column to existing messages table");
        }

        sqlx::query(CREATE_THREAD_INDEX)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn save_message(&self, thread_id: &str, message: &Message) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (thread, role, content, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        debug!("Saved {} message to thread {}", message.role, thread_id);
        Ok(())
    }

    async fn get_messages(&self, thread_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT role, content FROM messages WHERE thread = ? ORDER BY id",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .enumerate()
            .map(|(position, row)| Message {
                role: decode_role(thread_id, position, row.role.as_deref()),
                content: row.content,
            })
            .collect();

        Ok(messages)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
