use crate::constants::{CHAT_STORE_KEY, DB_PRAGMAS};
use crate::store::{serialized_size, ChatPersistence, StorageResult};
use crate::types::{Chat, ParleyError, Result, StorageError};
use futures_util::future::BoxFuture;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(ParleyError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = SqlitePool::connect(&url).await?;
    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(ParleyError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;
    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        sqlx::query(pragma).execute(pool).await?;
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => tracing::info!("Database initialized. Schema version: {}", version),
        Err(e) => tracing::warn!("Could not verify schema version: {}", e),
    }
}

/// Chat list stored as one JSON document, with a byte budget like browser
/// local storage.
#[derive(Debug, Clone)]
pub struct SqlitePersistence {
    pool: DbPool,
    capacity_bytes: usize,
}

impl SqlitePersistence {
    pub fn new(pool: DbPool, capacity_bytes: usize) -> Self {
        Self {
            pool,
            capacity_bytes,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn load_chats(&self) -> Result<Vec<Chat>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM chat_store WHERE key = ?")
            .bind(CHAT_STORE_KEY)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((json,)) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }
}

impl ChatPersistence for SqlitePersistence {
    fn commit<'a>(&'a self, chats: &'a [Chat]) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let needed = serialized_size(chats)?;
            if needed > self.capacity_bytes {
                return Err(StorageError::QuotaExceeded {
                    needed,
                    capacity: self.capacity_bytes,
                });
            }
            let json = serde_json::to_string(chats).map_err(|e| StorageError::Backend(e.to_string()))?;

            sqlx::query(
                "INSERT INTO chat_store (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(CHAT_STORE_KEY)
            .bind(json)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            tracing::debug!("[STORE] Committed {} chats ({} bytes)", chats.len(), needed);
            Ok(())
        })
    }
}
