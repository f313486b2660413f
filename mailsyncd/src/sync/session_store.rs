use std::{fs, path::PathBuf};

use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::session::{NewSession, ProgressUpdate, SessionStatus, SyncSession, SyncType};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const SESSION_COLUMNS: &str = "id, sync_type, source, max_records, start_date, end_date, query_filter, status, started_at, completed_at, last_activity_at, records_processed, records_synced, records_updated, records_skipped, batches_processed, error_count, last_error_message, notes";

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid sync type: {0}")]
    InvalidSyncType(String),
    #[error("invalid session status: {0}")]
    InvalidStatus(String),
    #[error("session not found after insert")]
    MissingSession,
}

/// Durable record of sync attempts, one row per attempt.
///
/// Status changes only ever leave `started`/`running`; rows that reached
/// `completed` or `stopped` are never rewritten.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, SessionStoreError> {
        let options = database_url
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, SessionStoreError> {
        let db_path = default_db_path()?;
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), SessionStoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn insert(
        &self,
        session: &NewSession,
        now: i64,
    ) -> Result<SyncSession, SessionStoreError> {
        let result = sqlx::query(
            "INSERT INTO sync_sessions (
                sync_type,
                source,
                max_records,
                start_date,
                end_date,
                query_filter,
                status,
                started_at,
                last_activity_at,
                notes
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'started', ?7, ?7, ?8)",
        )
        .bind(session.sync_type.as_str())
        .bind(&session.source)
        .bind(session.max_records.map(i64::from))
        .bind(&session.start_date)
        .bind(&session.end_date)
        .bind(&session.query_filter)
        .bind(now)
        .bind(&session.notes)
        .execute(&self.pool)
        .await?;

        self.get(result.last_insert_rowid())
            .await?
            .ok_or(SessionStoreError::MissingSession)
    }

    pub async fn get(&self, id: i64) -> Result<Option<SyncSession>, SessionStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Moves an active row to `status`, appending `note` to its notes.
    /// Returns false when the row is missing or already finished.
    pub async fn update_status(
        &self,
        id: i64,
        status: SessionStatus,
        note: Option<&str>,
        now: i64,
    ) -> Result<bool, SessionStoreError> {
        let completed_at = (!status.is_active()).then_some(now);
        let result = sqlx::query(
            "UPDATE sync_sessions
             SET status = ?2,
                 completed_at = COALESCE(?3, completed_at),
                 last_activity_at = ?4,
                 notes = CASE
                     WHEN ?5 IS NULL THEN notes
                     WHEN notes = '' THEN ?5
                     ELSE notes || char(10) || ?5
                 END
             WHERE id = ?1 AND status IN ('started', 'running')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .bind(now)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Applies counters reported by the ingestion process and promotes a
    /// `started` row to `running`.
    pub async fn update_progress(
        &self,
        id: i64,
        update: &ProgressUpdate,
        now: i64,
    ) -> Result<bool, SessionStoreError> {
        let result = sqlx::query(
            "UPDATE sync_sessions
             SET records_processed = COALESCE(?2, records_processed),
                 records_synced = COALESCE(?3, records_synced),
                 records_updated = COALESCE(?4, records_updated),
                 records_skipped = COALESCE(?5, records_skipped),
                 batches_processed = COALESCE(?6, batches_processed),
                 error_count = COALESCE(?7, error_count),
                 last_error_message = COALESCE(?8, last_error_message),
                 last_activity_at = ?9,
                 status = CASE WHEN status = 'started' THEN 'running' ELSE status END
             WHERE id = ?1 AND status IN ('started', 'running')",
        )
        .bind(id)
        .bind(update.records_processed)
        .bind(update.records_synced)
        .bind(update.records_updated)
        .bind(update.records_skipped)
        .bind(update.batches_processed)
        .bind(update.error_count)
        .bind(&update.last_error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Final counters and the `completed` status land in one statement.
    pub async fn complete(
        &self,
        id: i64,
        final_counts: &ProgressUpdate,
        now: i64,
    ) -> Result<bool, SessionStoreError> {
        let result = sqlx::query(
            "UPDATE sync_sessions
             SET records_processed = COALESCE(?2, records_processed),
                 records_synced = COALESCE(?3, records_synced),
                 records_updated = COALESCE(?4, records_updated),
                 records_skipped = COALESCE(?5, records_skipped),
                 batches_processed = COALESCE(?6, batches_processed),
                 error_count = COALESCE(?7, error_count),
                 last_error_message = COALESCE(?8, last_error_message),
                 last_activity_at = ?9,
                 completed_at = ?9,
                 status = 'completed'
             WHERE id = ?1 AND status IN ('started', 'running')",
        )
        .bind(id)
        .bind(final_counts.records_processed)
        .bind(final_counts.records_synced)
        .bind(final_counts.records_updated)
        .bind(final_counts.records_skipped)
        .bind(final_counts.batches_processed)
        .bind(final_counts.error_count)
        .bind(&final_counts.last_error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_active(&self) -> Result<Option<SyncSession>, SessionStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions
             WHERE status IN ('started', 'running')
             ORDER BY started_at DESC, id DESC
             LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn count_active(&self) -> Result<i64, SessionStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sync_sessions WHERE status IN ('started', 'running')",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn find_most_recent_by_status(
        &self,
        statuses: &[SessionStatus],
    ) -> Result<Option<SyncSession>, SessionStoreError> {
        if statuses.is_empty() {
            return Ok(None);
        }
        let placeholders = (1..=statuses.len())
            .map(|idx| format!("?{idx}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions
             WHERE status IN ({placeholders})
             ORDER BY started_at DESC, id DESC
             LIMIT 1"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let row = query.fetch_optional(&self.pool).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    pub async fn find_latest(&self) -> Result<Option<SyncSession>, SessionStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions ORDER BY started_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Stops every active row started more than `threshold_secs` ago and
    /// returns the ids it touched.
    pub async fn mark_stale_as_stopped(
        &self,
        threshold_secs: i64,
        now: i64,
    ) -> Result<Vec<i64>, SessionStoreError> {
        let cutoff = now.saturating_sub(threshold_secs);
        let note = format!("stale: auto-stopped after exceeding {threshold_secs}s without finishing");
        let ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE sync_sessions
             SET status = 'stopped',
                 completed_at = ?2,
                 notes = CASE WHEN notes = '' THEN ?3 ELSE notes || char(10) || ?3 END
             WHERE status IN ('started', 'running') AND started_at < ?1
             RETURNING id",
        )
        .bind(cutoff)
        .bind(now)
        .bind(&note)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    pub async fn mark_active_as_stopped(
        &self,
        note: &str,
        now: i64,
    ) -> Result<u64, SessionStoreError> {
        let result = sqlx::query(
            "UPDATE sync_sessions
             SET status = 'stopped',
                 completed_at = ?1,
                 notes = CASE WHEN notes = '' THEN ?2 ELSE notes || char(10) || ?2 END
             WHERE status IN ('started', 'running')",
        )
        .bind(now)
        .bind(note)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn history(&self, limit: u32) -> Result<Vec<SyncSession>, SessionStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sync_sessions
             ORDER BY started_at DESC, id DESC
             LIMIT ?1"
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(session_from_row(row)?);
        }
        Ok(out)
    }

    /// Deletes finished sessions started before `cutoff`. Active rows are
    /// kept regardless of age.
    pub async fn prune_older_than(&self, cutoff: i64) -> Result<u64, SessionStoreError> {
        let result = sqlx::query(
            "DELETE FROM sync_sessions
             WHERE started_at < ?1 AND status NOT IN ('started', 'running')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn session_from_row(row: &SqliteRow) -> Result<SyncSession, SessionStoreError> {
    let sync_type: String = row.try_get("sync_type")?;
    let status: String = row.try_get("status")?;
    let max_records: Option<i64> = row.try_get("max_records")?;
    Ok(SyncSession {
        id: row.try_get("id")?,
        sync_type: SyncType::parse(&sync_type)?,
        source: row.try_get("source")?,
        max_records: max_records.and_then(|value| u32::try_from(value).ok()),
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        query_filter: row.try_get("query_filter")?,
        status: SessionStatus::parse(&status)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        records_processed: row.try_get("records_processed")?,
        records_synced: row.try_get("records_synced")?,
        records_updated: row.try_get("records_updated")?,
        records_skipped: row.try_get("records_skipped")?,
        batches_processed: row.try_get("batches_processed")?,
        error_count: row.try_get("error_count")?,
        last_error_message: row.try_get("last_error_message")?,
        notes: row.try_get("notes")?,
    })
}

fn default_db_path() -> Result<PathBuf, SessionStoreError> {
    let mut path = dirs::data_dir().ok_or(SessionStoreError::MissingDataDir)?;
    path.push("mailsync");
    path.push("sessions.db");
    Ok(path)
}

#[cfg(test)]
#[path = "session_store_tests.rs"]
mod tests;
