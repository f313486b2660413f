use sqlx::SqlitePool;

use super::session_store::SessionStoreError;

/// Read-only view over the email records the ingestion process writes.
#[derive(Clone)]
pub struct RecordCounter {
    pool: SqlitePool,
}

impl RecordCounter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, SessionStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn max_id(&self) -> Result<Option<i64>, SessionStoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM emails")
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    /// Records written after `since_id`.
    pub async fn recent_count(&self, since_id: i64) -> Result<i64, SessionStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM emails WHERE id > ?1")
            .bind(since_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
