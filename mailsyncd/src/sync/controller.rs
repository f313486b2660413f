use std::sync::Arc;
use std::time::Duration;

use mailsync_core::{IngestClient, IngestError, StartRequest};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use super::backoff::StartRetryPolicy;
use super::resume::{CannotResumeReason, ResumeConfig, ResumeDecision, ResumePlanner};
use super::session::{NewSession, SessionStatus, SyncSession, SyncType, now_unix};
use super::session_store::{SessionStore, SessionStoreError};
use super::terminate::ForceTerminate;

pub const DEFAULT_STALE_CEILING_SECS: i64 = 2 * 60 * 60;
pub const DEFAULT_START_RECENCY_SECS: i64 = 5 * 60;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a sync is already running (session {session_id:?})")]
    Conflict { session_id: Option<i64> },
    #[error("ingestion process unavailable after {attempts} attempt(s): {source}")]
    IngestionUnavailable {
        attempts: u32,
        #[source]
        source: IngestError,
    },
    #[error("session store unavailable: {0}")]
    StoreUnavailable(#[from] SessionStoreError),
    #[error("no previous session to resume")]
    NotFound,
    #[error("session {session_id} finished too long ago to resume")]
    NotResumable {
        session_id: i64,
        finished_at: Option<i64>,
    },
    #[error("invalid sync configuration: {0}")]
    InvalidConfig(String),
    #[error("stop not confirmed: {active_rows} session(s) still active")]
    StopUnconfirmed { active_rows: i64 },
}

/// What the caller wants synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_type: SyncType,
    #[serde(default)]
    pub max_records: Option<u32>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub query_filter: Option<String>,
    pub source: String,
}

impl SyncConfig {
    pub fn new(sync_type: SyncType, source: &str) -> Self {
        Self {
            sync_type,
            max_records: None,
            start_date: None,
            end_date: None,
            query_filter: None,
            source: source.to_string(),
        }
    }

    fn validated(mut self) -> Result<Self, ControlError> {
        if self.max_records == Some(0) {
            return Err(ControlError::InvalidConfig(
                "max_records must be positive".to_string(),
            ));
        }
        if self.sync_type == SyncType::DateRange {
            let Some(start_date) = self.start_date.as_deref().filter(|d| !d.trim().is_empty())
            else {
                return Err(ControlError::InvalidConfig(
                    "date_range sync requires start_date".to_string(),
                ));
            };
            if self.query_filter.is_none() {
                self.query_filter = Some(format!("after:{start_date}"));
            }
        }
        Ok(self)
    }
}

/// In-process mirror of what this controller believes it started. The
/// session store wins whenever the two disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncControlState {
    pub is_active: bool,
    pub session_id: Option<i64>,
    pub started_at: Option<i64>,
    pub sync_type: Option<SyncType>,
    pub max_records: Option<u32>,
}

impl SyncControlState {
    fn for_session(session: &SyncSession) -> Self {
        Self {
            is_active: true,
            session_id: Some(session.id),
            started_at: Some(session.started_at),
            sync_type: Some(session.sync_type),
            max_records: session.max_records,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartOutcome {
    pub session_id: i64,
    pub accepted: bool,
    /// True when a resume adopted a session that was already running.
    pub claimed: bool,
    pub remote_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMethod {
    StopCommand,
    ForceTerminate,
    PersistedState,
    /// Nothing confirmed the stop; only local state was reset.
    LocalOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub method: StopMethod,
    pub previous_state: SyncControlState,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResumeOutcome {
    pub session_id: i64,
    pub resume_config: ResumeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub cleared_count: u64,
    pub store_error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ControllerSettings {
    pub stale_ceiling_secs: i64,
    pub start_recency_secs: i64,
    pub resume_window_secs: i64,
    pub stop_timeout: Duration,
    pub sweep_delay: Duration,
    pub start_retry: StartRetryPolicy,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            stale_ceiling_secs: DEFAULT_STALE_CEILING_SECS,
            start_recency_secs: DEFAULT_START_RECENCY_SECS,
            resume_window_secs: super::resume::DEFAULT_RESUME_WINDOW_SECS,
            stop_timeout: Duration::from_secs(3),
            sweep_delay: Duration::from_secs(5),
            start_retry: StartRetryPolicy::default(),
        }
    }
}

/// Serializes start, stop, resume and cleanup against the session store and
/// the ingestion process.
pub struct SyncController {
    store: SessionStore,
    client: IngestClient,
    terminator: Option<Arc<dyn ForceTerminate>>,
    settings: ControllerSettings,
    critical: Mutex<()>,
    state: watch::Sender<SyncControlState>,
}

impl SyncController {
    pub fn new(store: SessionStore, client: IngestClient, settings: ControllerSettings) -> Self {
        let (state, _) = watch::channel(SyncControlState::default());
        Self {
            store,
            client,
            terminator: None,
            settings,
            critical: Mutex::new(()),
            state,
        }
    }

    pub fn with_terminator(mut self, terminator: Arc<dyn ForceTerminate>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn local_state(&self) -> SyncControlState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncControlState> {
        self.state.subscribe()
    }

    pub async fn start(&self, config: SyncConfig) -> Result<StartOutcome, ControlError> {
        self.start_with_mode(config, false).await
    }

    pub async fn start_with_mode(
        &self,
        config: SyncConfig,
        resume: bool,
    ) -> Result<StartOutcome, ControlError> {
        let config = config.validated()?;
        let _guard = self.critical.lock().await;
        self.start_locked(config, resume, String::new()).await
    }

    async fn start_locked(
        &self,
        config: SyncConfig,
        resume: bool,
        notes: String,
    ) -> Result<StartOutcome, ControlError> {
        let now = now_unix();
        let local = self.local_state();
        let local_blocks = local.is_active && !resume;

        let active = match self.store.find_active().await {
            Ok(active) => active,
            Err(err) if local_blocks => {
                warn!(error = %err, "session store unreachable while a local sync is active");
                return Err(ControlError::Conflict {
                    session_id: local.session_id,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if local_blocks && active.is_none() {
            warn!(
                session_id = ?local.session_id,
                "local sync flag has no active session behind it; clearing"
            );
            self.state.send_replace(SyncControlState::default());
        }

        if let Some(row) = active {
            let quiet = row.quiet_secs(now);
            if row.is_stale(now, self.settings.stale_ceiling_secs)
                || quiet > self.settings.start_recency_secs
            {
                let note = format!("auto-stopped: no activity for {quiet}s before a new start");
                self.store
                    .update_status(row.id, SessionStatus::Stopped, Some(&note), now)
                    .await?;
                info!(session_id = row.id, quiet_secs = quiet, "stopped abandoned session");
            } else if resume {
                info!(session_id = row.id, "resume claimed running session");
                self.state.send_replace(SyncControlState::for_session(&row));
                return Ok(StartOutcome {
                    session_id: row.id,
                    accepted: true,
                    claimed: true,
                    remote_session_id: None,
                });
            } else {
                return Err(ControlError::Conflict {
                    session_id: Some(row.id),
                });
            }
        }

        let session = self
            .store
            .insert(
                &NewSession {
                    sync_type: config.sync_type,
                    source: config.source.clone(),
                    max_records: config.max_records,
                    start_date: config.start_date.clone(),
                    end_date: config.end_date.clone(),
                    query_filter: config.query_filter.clone(),
                    notes,
                },
                now,
            )
            .await?;
        self.state.send_replace(SyncControlState::for_session(&session));
        let pending = PendingStart {
            controller: self,
            session_id: session.id,
            armed: true,
        };
        info!(
            session_id = session.id,
            sync_type = session.sync_type.as_str(),
            source = %session.source,
            "sync session created"
        );

        let request = StartRequest {
            sync_type: config.sync_type.as_str().to_string(),
            max_records: config.max_records,
            start_date: config.start_date,
            end_date: config.end_date,
            query_filter: config.query_filter,
            session_id: session.id,
        };
        let sent = self.send_start(&request).await;
        pending.disarm();
        match sent {
            Ok(remote_session_id) => Ok(StartOutcome {
                session_id: session.id,
                accepted: true,
                claimed: false,
                remote_session_id,
            }),
            Err((attempts, source)) => {
                self.state.send_replace(SyncControlState::default());
                let note = format!("ingestion process unavailable: {source}");
                if let Err(err) = self
                    .store
                    .update_status(session.id, SessionStatus::Stopped, Some(&note), now_unix())
                    .await
                {
                    warn!(session_id = session.id, error = %err, "failed to stop rejected session");
                }
                warn!(session_id = session.id, attempts, error = %source, "start command failed");
                Err(ControlError::IngestionUnavailable { attempts, source })
            }
        }
    }

    async fn send_start(&self, request: &StartRequest) -> Result<Option<String>, (u32, IngestError)> {
        let policy = self.settings.start_retry;
        let max_attempts = policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.client.start(request, policy.attempt_timeout).await {
                Ok(response) => {
                    let remote = response.session_id.map(|id| id.to_string());
                    debug!(session_id = request.session_id, remote = ?remote, "start command accepted");
                    return Ok(remote);
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= max_attempts || !err.is_retryable() {
                        return Err((attempt, err));
                    }
                    let delay = policy.delay_after(attempt - 1);
                    debug!(attempt, ?delay, error = %err, "retrying start command");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<StopOutcome, ControlError> {
        let _guard = self.critical.lock().await;
        let previous_state = self.state.send_replace(SyncControlState::default());
        let mut warnings = Vec::new();

        match self
            .store
            .mark_active_as_stopped("stopped on request", now_unix())
            .await
        {
            Ok(count) if count > 0 => info!(count, "marked active sessions stopped"),
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "could not mark sessions stopped");
                warnings.push(format!("session store: {err}"));
            }
        }

        let method = match self.client.stop(self.settings.stop_timeout).await {
            Ok(response) => {
                debug!(message = ?response.message, "stop command acknowledged");
                Some(StopMethod::StopCommand)
            }
            Err(err) => {
                warn!(error = %err, "stop command failed");
                warnings.push(format!("stop command: {err}"));
                self.force_terminate(&mut warnings).await
            }
        };

        let method = match method {
            Some(method) => method,
            None => match self.store.count_active().await {
                Ok(0) => StopMethod::PersistedState,
                Ok(active_rows) => return Err(ControlError::StopUnconfirmed { active_rows }),
                Err(err) => {
                    warn!(error = %err, "stop could not be confirmed by the session store");
                    warnings.push(format!("session store: {err}"));
                    StopMethod::LocalOnly
                }
            },
        };

        info!(?method, was_active = previous_state.is_active, "sync stopped");
        self.schedule_sweep();
        Ok(StopOutcome {
            method,
            previous_state,
            warnings,
        })
    }

    async fn force_terminate(&self, warnings: &mut Vec<String>) -> Option<StopMethod> {
        let terminator = self.terminator.as_ref()?;
        match terminator.terminate().await {
            Ok(()) => {
                info!(command = %terminator.describe(), "ingestion process force-terminated");
                Some(StopMethod::ForceTerminate)
            }
            Err(err) => {
                warn!(error = %err, "force-terminate failed");
                warnings.push(format!("force-terminate: {err}"));
                None
            }
        }
    }

    fn schedule_sweep(&self) {
        let store = self.store.clone();
        let delay = self.settings.sweep_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match store
                .mark_active_as_stopped("stopped by post-stop sweep", now_unix())
                .await
            {
                Ok(0) => {}
                Ok(count) => warn!(count, "post-stop sweep found active sessions"),
                Err(err) => debug!(error = %err, "post-stop sweep skipped"),
            }
        });
    }

    pub async fn resume(&self) -> Result<ResumeOutcome, ControlError> {
        let _guard = self.critical.lock().await;
        let planner = ResumePlanner::new(
            self.store.clone(),
            self.settings.stale_ceiling_secs,
            self.settings.resume_window_secs,
        );
        let resume_config = match planner.plan().await? {
            ResumeDecision::Resume(config) => config,
            ResumeDecision::CannotResume {
                reason: CannotResumeReason::NoHistory,
                ..
            } => return Err(ControlError::NotFound),
            ResumeDecision::CannotResume {
                reason: CannotResumeReason::TooOld,
                last_session_id,
                last_finished_at,
            } => {
                return Err(match last_session_id {
                    Some(session_id) => ControlError::NotResumable {
                        session_id,
                        finished_at: last_finished_at,
                    },
                    None => ControlError::NotFound,
                });
            }
        };

        let config = resume_config.sync_config().validated()?;
        let notes = format!("resumed from session {}", resume_config.source_session_id);
        let outcome = self.start_locked(config, true, notes).await?;
        info!(
            session_id = outcome.session_id,
            from = resume_config.source_session_id,
            reason = ?resume_config.reason,
            "sync resumed"
        );
        Ok(ResumeOutcome {
            session_id: outcome.session_id,
            resume_config,
        })
    }

    /// Forgets every active session. Local state is always reset, even when
    /// the store write fails.
    pub async fn cleanup(&self) -> CleanupOutcome {
        let _guard = self.critical.lock().await;
        self.state.send_replace(SyncControlState::default());
        match self
            .store
            .mark_active_as_stopped("cleared by cleanup", now_unix())
            .await
        {
            Ok(cleared_count) => {
                info!(cleared_count, "cleanup finished");
                CleanupOutcome {
                    cleared_count,
                    store_error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "cleanup could not reach the session store");
                CleanupOutcome {
                    cleared_count: 0,
                    store_error: Some(err.to_string()),
                }
            }
        }
    }
}

/// Rolls back a start whose future was dropped before the ingestion
/// process answered.
struct PendingStart<'a> {
    controller: &'a SyncController,
    session_id: i64,
    armed: bool,
}

impl PendingStart<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session_id = self.session_id;
        self.controller
            .state
            .send_replace(SyncControlState::default());
        warn!(session_id, "start abandoned before the ingestion process answered");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.controller.store.clone();
        handle.spawn(async move {
            if let Err(err) = store
                .update_status(
                    session_id,
                    SessionStatus::Stopped,
                    Some("start cancelled before the ingestion process answered"),
                    now_unix(),
                )
                .await
            {
                warn!(session_id, error = %err, "failed to stop abandoned session");
            }
        });
    }
}

#[cfg(test)]
#[path = "controller_tests.rs"]
mod tests;
