use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::session_store::SessionStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
    DateRange,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
            SyncType::DateRange => "date_range",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SessionStoreError> {
        match value {
            "full" => Ok(SyncType::Full),
            "incremental" => Ok(SyncType::Incremental),
            "date_range" | "date-range" => Ok(SyncType::DateRange),
            other => Err(SessionStoreError::InvalidSyncType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Started,
    Running,
    Completed,
    Stopped,
}

impl SessionStatus {
    pub const ACTIVE: [SessionStatus; 2] = [SessionStatus::Started, SessionStatus::Running];
    pub const FINISHED: [SessionStatus; 2] = [SessionStatus::Completed, SessionStatus::Stopped];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Started => "started",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Stopped => "stopped",
        }
    }

    pub fn parse(value: &str) -> Result<Self, SessionStoreError> {
        match value {
            "started" => Ok(SessionStatus::Started),
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "stopped" => Ok(SessionStatus::Stopped),
            other => Err(SessionStoreError::InvalidStatus(other.to_string())),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Started | SessionStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub sync_type: SyncType,
    pub source: String,
    pub max_records: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub query_filter: Option<String>,
    pub notes: String,
}

/// One persisted sync attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSession {
    pub id: i64,
    pub sync_type: SyncType,
    pub source: String,
    pub max_records: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub query_filter: Option<String>,
    pub status: SessionStatus,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub last_activity_at: i64,
    pub records_processed: i64,
    pub records_synced: i64,
    pub records_updated: i64,
    pub records_skipped: i64,
    pub batches_processed: i64,
    pub error_count: i64,
    pub last_error_message: Option<String>,
    pub notes: String,
}

impl SyncSession {
    pub fn age_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.started_at).max(0)
    }

    /// Stale means started longer ago than `ceiling_secs`, whatever the
    /// recent activity.
    pub fn is_stale(&self, now: i64, ceiling_secs: i64) -> bool {
        self.status.is_active() && self.age_secs(now) > ceiling_secs
    }

    /// Seconds since the newest signal this row carries.
    pub fn quiet_secs(&self, now: i64) -> i64 {
        let last = self.last_activity_at.max(self.started_at);
        now.saturating_sub(last).max(0)
    }
}

/// Counter changes reported by the ingestion process. `None` leaves the
/// stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub records_processed: Option<i64>,
    pub records_synced: Option<i64>,
    pub records_updated: Option<i64>,
    pub records_skipped: Option<i64>,
    pub batches_processed: Option<i64>,
    pub error_count: Option<i64>,
    pub last_error_message: Option<String>,
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

pub fn format_unix(ts: i64) -> Option<String> {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
}
