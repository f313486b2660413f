use serde::Serialize;
use tracing::info;

use super::controller::SyncConfig;
use super::session::{SessionStatus, SyncSession, SyncType, now_unix};
use super::session_store::{SessionStore, SessionStoreError};

pub const DEFAULT_RESUME_WINDOW_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeReason {
    StaleSession,
    ContinueFromLast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CannotResumeReason {
    TooOld,
    NoHistory,
}

/// Parameters for restarting a previous run, plus where they came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeConfig {
    pub sync_type: SyncType,
    pub max_records: Option<u32>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub query_filter: Option<String>,
    pub source_session_id: i64,
    pub records_synced: i64,
    pub completed_at: Option<i64>,
    pub reason: ResumeReason,
}

impl ResumeConfig {
    fn from_session(session: &SyncSession, reason: ResumeReason) -> Self {
        Self {
            sync_type: session.sync_type,
            max_records: session.max_records,
            start_date: session.start_date.clone(),
            end_date: session.end_date.clone(),
            query_filter: session.query_filter.clone(),
            source_session_id: session.id,
            records_synced: session.records_synced,
            completed_at: session.completed_at,
            reason,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_type: self.sync_type,
            max_records: self.max_records,
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
            query_filter: self.query_filter.clone(),
            source: "resume".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ResumeDecision {
    Resume(ResumeConfig),
    CannotResume {
        reason: CannotResumeReason,
        last_session_id: Option<i64>,
        last_finished_at: Option<i64>,
    },
}

#[derive(Clone)]
pub struct ResumePlanner {
    store: SessionStore,
    stale_ceiling_secs: i64,
    resume_window_secs: i64,
}

impl ResumePlanner {
    pub fn new(store: SessionStore, stale_ceiling_secs: i64, resume_window_secs: i64) -> Self {
        Self {
            store,
            stale_ceiling_secs,
            resume_window_secs,
        }
    }

    pub async fn plan(&self) -> Result<ResumeDecision, SessionStoreError> {
        self.plan_at(now_unix()).await
    }

    pub async fn plan_at(&self, now: i64) -> Result<ResumeDecision, SessionStoreError> {
        let swept = self
            .store
            .mark_stale_as_stopped(self.stale_ceiling_secs, now)
            .await?;
        if !swept.is_empty() {
            info!(sessions = ?swept, "stopped stale sessions before resume");
        }

        let Some(last) = self
            .store
            .find_most_recent_by_status(&SessionStatus::FINISHED)
            .await?
        else {
            return Ok(ResumeDecision::CannotResume {
                reason: CannotResumeReason::NoHistory,
                last_session_id: None,
                last_finished_at: None,
            });
        };

        if swept.contains(&last.id) {
            return Ok(ResumeDecision::Resume(ResumeConfig::from_session(
                &last,
                ResumeReason::StaleSession,
            )));
        }

        let finished_at = last.completed_at.unwrap_or(last.started_at);
        if now.saturating_sub(finished_at) <= self.resume_window_secs {
            return Ok(ResumeDecision::Resume(ResumeConfig::from_session(
                &last,
                ResumeReason::ContinueFromLast,
            )));
        }

        Ok(ResumeDecision::CannotResume {
            reason: CannotResumeReason::TooOld,
            last_session_id: Some(last.id),
            last_finished_at: Some(finished_at),
        })
    }
}
