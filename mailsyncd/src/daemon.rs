use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mailsync_core::IngestClient;
use tracing::{debug, info, warn};

use crate::sync::activity::ActivityTracker;
use crate::sync::backoff::StartRetryPolicy;
use crate::sync::controller::{
    ControllerSettings, DEFAULT_STALE_CEILING_SECS, DEFAULT_START_RECENCY_SECS, SyncController,
};
use crate::sync::records::RecordCounter;
use crate::sync::resume::DEFAULT_RESUME_WINDOW_SECS;
use crate::sync::session::now_unix;
use crate::sync::session_store::SessionStore;
use crate::sync::status::{StatusAggregator, StatusSettings, UnifiedStatus};
use crate::sync::terminate::{CommandTerminator, ForceTerminate};

const DEFAULT_INGEST_URL: &str = "http://127.0.0.1:8001";
const DEFAULT_POLL_SECS: u64 = 5;
const DEFAULT_TIMEOUT_THRESHOLD: u64 = 3;
const DEFAULT_HISTORY_DAYS: u64 = 30;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// `None` uses the per-user data directory.
    pub database_url: Option<String>,
    pub ingest_url: String,
    pub poll_interval: Duration,
    pub stale_ceiling_secs: i64,
    pub start_recency_secs: i64,
    pub resume_window_secs: i64,
    pub timeout_threshold: u32,
    pub service_unit: Option<String>,
    pub force_terminate_cmd: Option<String>,
    pub history_days: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            ingest_url: DEFAULT_INGEST_URL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            stale_ceiling_secs: DEFAULT_STALE_CEILING_SECS,
            start_recency_secs: DEFAULT_START_RECENCY_SECS,
            resume_window_secs: DEFAULT_RESUME_WINDOW_SECS,
            timeout_threshold: DEFAULT_TIMEOUT_THRESHOLD as u32,
            service_unit: None,
            force_terminate_cmd: None,
            history_days: DEFAULT_HISTORY_DAYS,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let ingest_url =
            read_optional_env("MAILSYNC_INGEST_URL").unwrap_or(defaults.ingest_url);
        url_check(&ingest_url)?;

        Ok(Self {
            database_url: read_optional_env("MAILSYNC_DATABASE_URL"),
            ingest_url,
            poll_interval: Duration::from_secs(read_u64_env(
                "MAILSYNC_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            stale_ceiling_secs: read_secs_env(
                "MAILSYNC_STALE_CEILING_SECS",
                defaults.stale_ceiling_secs,
            ),
            start_recency_secs: read_secs_env(
                "MAILSYNC_START_RECENCY_SECS",
                defaults.start_recency_secs,
            ),
            resume_window_secs: read_secs_env(
                "MAILSYNC_RESUME_WINDOW_SECS",
                defaults.resume_window_secs,
            ),
            timeout_threshold: u32::try_from(read_u64_env(
                "MAILSYNC_TIMEOUT_THRESHOLD",
                DEFAULT_TIMEOUT_THRESHOLD,
            ))
            .unwrap_or(u32::MAX),
            service_unit: read_optional_env("MAILSYNC_SERVICE_UNIT"),
            force_terminate_cmd: read_optional_env("MAILSYNC_FORCE_TERMINATE_CMD"),
            history_days: read_u64_env("MAILSYNC_HISTORY_DAYS", DEFAULT_HISTORY_DAYS),
        })
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            stale_ceiling_secs: self.stale_ceiling_secs,
            start_recency_secs: self.start_recency_secs,
            resume_window_secs: self.resume_window_secs,
            start_retry: StartRetryPolicy::default(),
            ..ControllerSettings::default()
        }
    }

    pub fn status_settings(&self) -> StatusSettings {
        StatusSettings {
            stale_ceiling_secs: self.stale_ceiling_secs,
            timeout_threshold: self.timeout_threshold,
            ..StatusSettings::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub stale_stopped: Vec<i64>,
    pub pruned: u64,
}

/// Shared handles for the poll loop and the one-shot commands. Each process
/// gets its own controller and aggregator; the session store is the only
/// state that outlives a command.
pub struct DaemonRuntime {
    config: DaemonConfig,
    store: SessionStore,
    records: RecordCounter,
    tracker: Arc<ActivityTracker>,
    controller: SyncController,
    aggregator: Arc<StatusAggregator>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = match config.database_url.as_deref() {
            Some(url) => SessionStore::new(url)
                .await
                .with_context(|| format!("failed to open session store at {url}"))?,
            None => SessionStore::new_default()
                .await
                .context("failed to initialize session store")?,
        };
        let client = IngestClient::with_base_url(&config.ingest_url)
            .with_context(|| format!("invalid ingestion url {}", config.ingest_url))?;

        let mut controller =
            SyncController::new(store.clone(), client.clone(), config.controller_settings());
        if let Some(terminator) = build_terminator(&config)? {
            info!(command = %terminator.describe(), "force-terminate configured");
            controller = controller.with_terminator(terminator);
        }

        let tracker = Arc::new(ActivityTracker::default());
        let aggregator = StatusAggregator::new(
            store.clone(),
            client,
            Arc::clone(&tracker),
            config.status_settings(),
        );

        Ok(Self {
            records: RecordCounter::new(store.pool().clone()),
            store,
            tracker,
            controller,
            aggregator: Arc::new(aggregator),
            config,
        })
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn controller(&self) -> &SyncController {
        &self.controller
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    /// Startup housekeeping: stop abandoned sessions and drop old history.
    pub async fn maintenance(&self) -> anyhow::Result<MaintenanceReport> {
        let now = now_unix();
        let stale_stopped = self
            .store
            .mark_stale_as_stopped(self.config.stale_ceiling_secs, now)
            .await
            .context("failed to sweep stale sessions")?;
        let pruned = self
            .store
            .prune_older_than(history_cutoff(now, self.config.history_days))
            .await
            .context("failed to prune session history")?;
        Ok(MaintenanceReport {
            stale_stopped,
            pruned,
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            ingest_url = %self.config.ingest_url,
            poll_secs = self.config.poll_interval.as_secs(),
            "mailsyncd started"
        );

        match self.maintenance().await {
            Ok(report) => info!(
                stale_stopped = report.stale_stopped.len(),
                pruned = report.pruned,
                "startup maintenance finished"
            ),
            Err(err) => warn!(error = %format!("{err:#}"), "startup maintenance failed"),
        }

        let records = self.records.clone();
        let tracker = Arc::clone(&self.tracker);
        let aggregator = Arc::clone(&self.aggregator);
        let poll_interval = self.config.poll_interval;
        let poll_handle = tokio::spawn(async move {
            let mut last: Option<UnifiedStatus> = None;
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let status = poll_once(&records, &tracker, &aggregator).await;
                if status_changed(last.as_ref(), &status) {
                    info!(
                        status = ?status.status,
                        source = ?status.source,
                        sync_type = ?status.sync_type,
                        session_id = ?status.session_id,
                        "sync status changed"
                    );
                }
                last = Some(status);
            }
        });

        let res = tokio::signal::ctrl_c().await;
        poll_handle.abort();
        res.context("failed waiting for shutdown signal")?;

        self.store.close().await;
        info!("mailsyncd stopped");
        Ok(())
    }
}

/// One observation tick: feed the activity window, then ask for a verdict.
async fn poll_once(
    records: &RecordCounter,
    tracker: &ActivityTracker,
    aggregator: &StatusAggregator,
) -> UnifiedStatus {
    match records.count().await {
        Ok(count) => tracker.observe(count),
        Err(err) => debug!(error = %err, "record count unavailable"),
    }
    aggregator.get_status().await
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
