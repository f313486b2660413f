use super::*;
use crate::sync::session::{NewSession, SessionStatus, SyncType};
use crate::sync::status::{StatusSource, SyncState};
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const DAY: i64 = 86_400;

fn session(sync_type: SyncType) -> NewSession {
    NewSession {
        sync_type,
        source: "background".into(),
        max_records: None,
        start_date: None,
        end_date: None,
        query_filter: None,
        notes: String::new(),
    }
}

fn config_for(dir: &std::path::Path, ingest_url: &str) -> DaemonConfig {
    DaemonConfig {
        database_url: Some(format!("sqlite://{}", dir.join("sessions.db").display())),
        ingest_url: ingest_url.to_string(),
        ..DaemonConfig::default()
    }
}

#[test]
fn reads_numbers_from_env_or_default() {
    assert_eq!(read_u64_env("MAILSYNC_NO_SUCH_ENV_FOR_TEST", 42), 42);
    assert_eq!(read_secs_env("MAILSYNC_NO_SUCH_ENV_FOR_TEST", 7200), 7200);
}

#[test]
fn missing_optional_env_is_none() {
    assert!(read_optional_env("MAILSYNC_NO_SUCH_OPTIONAL_ENV_FOR_TEST").is_none());
}

#[test]
fn defaults_match_documented_values() {
    let config = DaemonConfig::default();
    assert_eq!(config.ingest_url, "http://127.0.0.1:8001");
    assert_eq!(config.poll_interval, Duration::from_secs(5));
    assert_eq!(config.stale_ceiling_secs, 7200);
    assert_eq!(config.start_recency_secs, 300);
    assert_eq!(config.resume_window_secs, DAY);
    assert_eq!(config.timeout_threshold, 3);
    assert_eq!(config.history_days, 30);

    let settings = config.status_settings();
    assert_eq!(settings.timeout_threshold, 3);
    assert_eq!(settings.probe_timeout, Duration::from_secs(2));
}

#[test]
fn rejects_invalid_ingest_url() {
    assert!(url_check("not a url").is_err());
    assert!(url_check("http://localhost:8001").is_ok());
}

#[test]
fn terminate_command_takes_precedence_over_unit() {
    let mut config = DaemonConfig {
        service_unit: Some("mail-ingest.service".into()),
        ..DaemonConfig::default()
    };
    let terminator = build_terminator(&config).unwrap().unwrap();
    assert_eq!(
        terminator.describe(),
        "systemctl --user restart mail-ingest.service"
    );

    config.force_terminate_cmd = Some("docker restart ingest".into());
    let terminator = build_terminator(&config).unwrap().unwrap();
    assert_eq!(terminator.describe(), "docker restart ingest");

    assert!(build_terminator(&DaemonConfig::default()).unwrap().is_none());
}

#[test]
fn history_cutoff_counts_whole_days() {
    assert_eq!(history_cutoff(100 * DAY, 30), 70 * DAY);
    assert!(history_cutoff(0, u64::MAX) < 0);
}

#[test]
fn status_change_ignores_progress_only_updates() {
    let make = |status, source, session_id| UnifiedStatus {
        status,
        source,
        sync_type: None,
        session_id,
        progress: None,
        estimated: false,
        notes: Vec::new(),
        checked_at: None,
    };
    let idle = make(SyncState::Ready, StatusSource::Idle, None);
    let running = make(SyncState::Syncing, StatusSource::Session, Some(1));
    let mut running_later = running.clone();
    running_later.notes.push("progress moved".into());

    assert!(status_changed(None, &idle));
    assert!(status_changed(Some(&idle), &running));
    assert!(!status_changed(Some(&running), &running_later));
}

#[tokio::test]
async fn maintenance_sweeps_stale_and_prunes_old_rows() {
    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config_for(dir.path(), "http://127.0.0.1:9"))
        .await
        .unwrap();
    let now = now_unix();
    let stale = runtime
        .store()
        .insert(&session(SyncType::Full), now - 3 * 3600)
        .await
        .unwrap();
    let ancient = runtime
        .store()
        .insert(&session(SyncType::Incremental), now - 60 * DAY)
        .await
        .unwrap();
    runtime
        .store()
        .update_status(ancient.id, SessionStatus::Completed, None, now - 60 * DAY)
        .await
        .unwrap();

    let report = runtime.maintenance().await.unwrap();

    assert_eq!(report.stale_stopped, vec![stale.id]);
    assert_eq!(report.pruned, 1);
    let row = runtime.store().get(stale.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Stopped);
    assert!(runtime.store().get(ancient.id).await.unwrap().is_none());
}

#[tokio::test]
async fn poll_once_feeds_activity_window() {
    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config_for(dir.path(), "http://127.0.0.1:9"))
        .await
        .unwrap();

    let first = poll_once(&runtime.records, &runtime.tracker, &runtime.aggregator).await;
    assert_eq!(first.status, SyncState::Ready);

    for idx in 0..5 {
        sqlx::query("INSERT INTO emails (message_id, created_at) VALUES (?1, 0)")
            .bind(format!("<{idx}@example.com>"))
            .execute(runtime.store().pool())
            .await
            .unwrap();
    }

    let second = poll_once(&runtime.records, &runtime.tracker, &runtime.aggregator).await;
    assert_eq!(second.status, SyncState::Syncing);
    assert_eq!(second.source, StatusSource::Activity);
    assert_eq!(second.progress.unwrap().records_processed, 5);
}

#[tokio::test]
async fn bootstrapped_controller_round_trips_a_sync() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session_id": 11 })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/sync/stop"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "ok" })))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let runtime = DaemonRuntime::bootstrap(config_for(dir.path(), &server.uri()))
        .await
        .unwrap();

    let config = crate::sync::controller::SyncConfig::new(SyncType::Incremental, "cli");
    let started = runtime.controller().start(config).await.unwrap();
    let status = runtime.aggregator().get_status().await;
    assert_eq!(status.session_id, Some(started.session_id));

    runtime.controller().stop().await.unwrap();
    assert_eq!(runtime.store().count_active().await.unwrap(), 0);
}

#[tokio::test]
async fn separate_runtimes_share_state_through_the_store() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sync/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let first = DaemonRuntime::bootstrap(config_for(dir.path(), &server.uri()))
        .await
        .unwrap();
    let second = DaemonRuntime::bootstrap(config_for(dir.path(), &server.uri()))
        .await
        .unwrap();

    let config = crate::sync::controller::SyncConfig::new(SyncType::Full, "cli");
    let started = first.controller().start(config.clone()).await.unwrap();

    assert!(!second.controller().local_state().is_active);
    let err = second.controller().start(config).await.unwrap_err();
    assert!(matches!(
        err,
        crate::sync::controller::ControlError::Conflict { session_id: Some(id) }
            if id == started.session_id
    ));

    let status = second.aggregator().get_status().await;
    assert_eq!(status.source, StatusSource::Session);
    assert_eq!(status.session_id, Some(started.session_id));
}
