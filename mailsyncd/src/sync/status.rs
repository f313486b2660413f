use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use mailsync_core::{IngestClient, IngestError, IngestProgress, IngestStatus};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::activity::ActivityTracker;
use super::controller::DEFAULT_STALE_CEILING_SECS;
use super::session::{SessionStatus, SyncSession, format_unix, now_unix};
use super::session_store::SessionStore;

const PROGRESS_CAP_PCT: f64 = 95.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Syncing,
    Ready,
}

/// Which signal produced the verdict, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Session,
    Remote,
    Activity,
    ProbeTimeouts,
    Idle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressView {
    pub records_processed: i64,
    pub records_synced: Option<i64>,
    pub max_records: Option<u32>,
    pub progress_pct: Option<f64>,
    pub throughput_per_minute: Option<f64>,
    pub estimated_completion: Option<String>,
    pub current_batch: Option<u64>,
    pub total_batches: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedStatus {
    pub status: SyncState,
    pub source: StatusSource,
    pub sync_type: Option<String>,
    pub session_id: Option<i64>,
    pub progress: Option<ProgressView>,
    pub estimated: bool,
    pub notes: Vec<String>,
    pub checked_at: Option<String>,
}

impl UnifiedStatus {
    fn new(status: SyncState, source: StatusSource, now: i64, notes: Vec<String>) -> Self {
        Self {
            status,
            source,
            sync_type: None,
            session_id: None,
            progress: None,
            estimated: false,
            notes,
            checked_at: format_unix(now),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.status == SyncState::Syncing
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusSettings {
    pub stale_ceiling_secs: i64,
    pub probe_timeout: Duration,
    pub probe_retry_timeout: Duration,
    pub progress_timeout: Duration,
    pub timeout_threshold: u32,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            stale_ceiling_secs: DEFAULT_STALE_CEILING_SECS,
            probe_timeout: Duration::from_secs(2),
            probe_retry_timeout: Duration::from_millis(500),
            progress_timeout: Duration::from_secs(1),
            timeout_threshold: 3,
        }
    }
}

enum Probe {
    Running,
    Idle,
    Failed { timed_out: bool },
}

/// Folds the session store, remote probes and local activity into one
/// answer to "is a sync running right now?".
pub struct StatusAggregator {
    store: SessionStore,
    client: IngestClient,
    tracker: Arc<ActivityTracker>,
    settings: StatusSettings,
    timeout_streak: AtomicU32,
}

impl StatusAggregator {
    pub fn new(
        store: SessionStore,
        client: IngestClient,
        tracker: Arc<ActivityTracker>,
        settings: StatusSettings,
    ) -> Self {
        Self {
            store,
            client,
            tracker,
            settings,
            timeout_streak: AtomicU32::new(0),
        }
    }

    pub fn timeout_streak(&self) -> u32 {
        self.timeout_streak.load(Ordering::Relaxed)
    }

    pub async fn get_status(&self) -> UnifiedStatus {
        self.get_status_at(now_unix()).await
    }

    pub async fn get_status_at(&self, now: i64) -> UnifiedStatus {
        let mut notes = Vec::new();
        let mut heuristics_allowed = true;

        match self.store.find_active().await {
            Ok(Some(row)) if row.is_stale(now, self.settings.stale_ceiling_secs) => {
                heuristics_allowed = false;
                // Deltas seen so far belong to the abandoned run.
                self.tracker.clear();
                let note = format!(
                    "stale: no completion after {}s",
                    self.settings.stale_ceiling_secs
                );
                match self
                    .store
                    .update_status(row.id, SessionStatus::Stopped, Some(&note), now)
                    .await
                {
                    Ok(_) => info!(session_id = row.id, "marked stale session stopped"),
                    Err(err) => warn!(session_id = row.id, error = %err, "failed to stop stale session"),
                }
                notes.push(format!("session {} was stale and has been stopped", row.id));
            }
            Ok(Some(row)) => return session_status(&row, now, notes),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "session store unavailable for status");
                notes.push(format!("session store unavailable: {err}"));
            }
        }

        match self.probe().await {
            Probe::Running => {
                self.timeout_streak.store(0, Ordering::Relaxed);
                let mut status = UnifiedStatus::new(SyncState::Syncing, StatusSource::Remote, now, notes);
                status.progress = self.remote_progress().await;
                return status;
            }
            Probe::Idle => {
                self.timeout_streak.store(0, Ordering::Relaxed);
                self.tracker.clear();
                return UnifiedStatus::new(SyncState::Ready, StatusSource::Remote, now, notes);
            }
            Probe::Failed { timed_out: true } => {
                self.timeout_streak.fetch_add(1, Ordering::Relaxed);
            }
            Probe::Failed { timed_out: false } => {
                self.timeout_streak.store(0, Ordering::Relaxed);
            }
        }

        if heuristics_allowed && self.tracker.is_active(now) {
            let summary = self.tracker.summarize(now);
            let mut status =
                UnifiedStatus::new(SyncState::Syncing, StatusSource::Activity, now, notes);
            status.sync_type = Some("detected".to_string());
            status.estimated = true;
            status.progress = Some(ProgressView {
                records_processed: summary.recent_change_count,
                throughput_per_minute: Some(summary.changes_per_minute),
                ..ProgressView::default()
            });
            return status;
        }

        let streak = self.timeout_streak();
        if heuristics_allowed && streak >= self.settings.timeout_threshold {
            let mut status =
                UnifiedStatus::new(SyncState::Syncing, StatusSource::ProbeTimeouts, now, notes);
            status.sync_type = Some("detected_from_timeouts".to_string());
            status.estimated = true;
            status.notes.push(format!(
                "ingestion process timed out {streak} times in a row; it may be busy syncing"
            ));
            return status;
        }

        UnifiedStatus::new(SyncState::Ready, StatusSource::Idle, now, notes)
    }

    async fn probe(&self) -> Probe {
        let first = self.client.status(self.settings.probe_timeout).await;
        let result = match first {
            Ok(status) => Ok(status),
            Err(err) => {
                debug!(error = %err, "status probe failed, retrying");
                self.client.status(self.settings.probe_retry_timeout).await
            }
        };
        classify_probe(result)
    }

    async fn remote_progress(&self) -> Option<ProgressView> {
        match self.client.progress(self.settings.progress_timeout).await {
            Ok(progress) => Some(remote_progress_view(&progress)),
            Err(err) => {
                debug!(error = %err, "progress endpoint unavailable");
                None
            }
        }
    }
}

fn classify_probe(result: Result<IngestStatus, IngestError>) -> Probe {
    match result {
        Ok(status) if status.sync_in_progress => Probe::Running,
        Ok(_) => Probe::Idle,
        Err(err) => {
            debug!(error = %err, timed_out = err.is_timeout(), "status probe gave up");
            Probe::Failed {
                timed_out: err.is_timeout(),
            }
        }
    }
}

fn session_status(row: &SyncSession, now: i64, notes: Vec<String>) -> UnifiedStatus {
    let mut status = UnifiedStatus::new(SyncState::Syncing, StatusSource::Session, now, notes);
    status.sync_type = Some(row.sync_type.as_str().to_string());
    status.session_id = Some(row.id);
    status.progress = Some(session_progress(row, now));
    status
}

fn session_progress(row: &SyncSession, now: i64) -> ProgressView {
    let processed = row.records_processed;
    let progress_pct = row
        .max_records
        .filter(|max| *max > 0)
        .map(|max| (processed as f64 / f64::from(max) * 100.0).min(PROGRESS_CAP_PCT));

    let elapsed_minutes = row.age_secs(now) as f64 / 60.0;
    let basis = if row.records_synced > 0 {
        row.records_synced
    } else {
        processed
    };
    let throughput = (elapsed_minutes > 0.0).then(|| basis as f64 / elapsed_minutes);

    let estimated_completion = match (throughput, row.max_records) {
        (Some(rate), Some(max)) if rate > 0.0 => {
            let remaining = (i64::from(max) - processed).max(0) as f64;
            let eta_secs = (remaining / rate * 60.0).round() as i64;
            format_unix(now.saturating_add(eta_secs))
        }
        _ => None,
    };

    ProgressView {
        records_processed: processed,
        records_synced: Some(row.records_synced),
        max_records: row.max_records,
        progress_pct,
        throughput_per_minute: throughput,
        estimated_completion,
        current_batch: u64::try_from(row.batches_processed).ok(),
        total_batches: None,
    }
}

fn remote_progress_view(progress: &IngestProgress) -> ProgressView {
    ProgressView {
        records_processed: i64::try_from(progress.emails_processed).unwrap_or(i64::MAX),
        records_synced: None,
        max_records: None,
        progress_pct: progress.progress,
        throughput_per_minute: Some(progress.emails_per_minute),
        estimated_completion: None,
        current_batch: Some(progress.current_batch),
        total_batches: Some(progress.total_batches),
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
