use super::*;
use crate::sync::test_support::memory_store;

const NOW: i64 = 1_700_000_000;

fn full_sync() -> NewSession {
    NewSession {
        sync_type: SyncType::Full,
        source: "dashboard".into(),
        max_records: Some(1000),
        start_date: None,
        end_date: None,
        query_filter: None,
        notes: String::new(),
    }
}

#[tokio::test]
async fn insert_starts_session_with_zero_counters() {
    let store = memory_store().await;
    let session = store.insert(&full_sync(), NOW).await.unwrap();

    assert_eq!(session.status, SessionStatus::Started);
    assert_eq!(session.started_at, NOW);
    assert_eq!(session.last_activity_at, NOW);
    assert_eq!(session.max_records, Some(1000));
    assert_eq!(session.records_processed, 0);
    assert!(session.completed_at.is_none());

    let fetched = store.get(session.id).await.unwrap();
    assert_eq!(fetched, Some(session));
}

#[tokio::test]
async fn update_status_leaves_finished_rows_alone() {
    let store = memory_store().await;
    let session = store.insert(&full_sync(), NOW).await.unwrap();

    let stopped = store
        .update_status(session.id, SessionStatus::Stopped, Some("user stop"), NOW + 5)
        .await
        .unwrap();
    assert!(stopped);

    let reopened = store
        .update_status(session.id, SessionStatus::Running, None, NOW + 10)
        .await
        .unwrap();
    assert!(!reopened);

    let row = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Stopped);
    assert_eq!(row.completed_at, Some(NOW + 5));
    assert_eq!(row.notes, "user stop");
}

#[tokio::test]
async fn notes_accumulate() {
    let store = memory_store().await;
    let mut input = full_sync();
    input.notes = "resumed".into();
    let session = store.insert(&input, NOW).await.unwrap();

    store
        .update_status(session.id, SessionStatus::Stopped, Some("stopped"), NOW + 1)
        .await
        .unwrap();

    let row = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(row.notes, "resumed\nstopped");
}

#[tokio::test]
async fn progress_promotes_started_to_running() {
    let store = memory_store().await;
    let session = store.insert(&full_sync(), NOW).await.unwrap();

    let update = ProgressUpdate {
        records_processed: Some(250),
        records_synced: Some(200),
        batches_processed: Some(3),
        ..ProgressUpdate::default()
    };
    assert!(store.update_progress(session.id, &update, NOW + 60).await.unwrap());

    let row = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Running);
    assert_eq!(row.records_processed, 250);
    assert_eq!(row.records_synced, 200);
    assert_eq!(row.records_skipped, 0);
    assert_eq!(row.last_activity_at, NOW + 60);
}

#[tokio::test]
async fn complete_records_final_counts() {
    let store = memory_store().await;
    let session = store.insert(&full_sync(), NOW).await.unwrap();

    let counts = ProgressUpdate {
        records_processed: Some(1000),
        records_synced: Some(990),
        ..ProgressUpdate::default()
    };
    assert!(store.complete(session.id, &counts, NOW + 600).await.unwrap());
    assert!(!store.complete(session.id, &counts, NOW + 700).await.unwrap());

    let row = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Completed);
    assert_eq!(row.completed_at, Some(NOW + 600));
    assert_eq!(row.records_synced, 990);
}

#[tokio::test]
async fn find_active_returns_newest_active_row() {
    let store = memory_store().await;
    assert!(store.find_active().await.unwrap().is_none());

    let older = store.insert(&full_sync(), NOW).await.unwrap();
    let newer = store.insert(&full_sync(), NOW + 10).await.unwrap();
    store
        .update_status(newer.id, SessionStatus::Completed, None, NOW + 20)
        .await
        .unwrap();

    let active = store.find_active().await.unwrap().unwrap();
    assert_eq!(active.id, older.id);
    assert_eq!(store.count_active().await.unwrap(), 1);
}

#[tokio::test]
async fn most_recent_by_status_filters() {
    let store = memory_store().await;
    let first = store.insert(&full_sync(), NOW).await.unwrap();
    let second = store.insert(&full_sync(), NOW + 100).await.unwrap();
    store
        .update_status(first.id, SessionStatus::Completed, None, NOW + 50)
        .await
        .unwrap();

    let finished = store
        .find_most_recent_by_status(&SessionStatus::FINISHED)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.id, first.id);

    let latest = store.find_latest().await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);

    assert!(store.find_most_recent_by_status(&[]).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_sweep_only_touches_old_active_rows() {
    let store = memory_store().await;
    let stale = store.insert(&full_sync(), NOW - 3 * 3600).await.unwrap();
    let fresh = store.insert(&full_sync(), NOW - 600).await.unwrap();
    let finished = store.insert(&full_sync(), NOW - 5 * 3600).await.unwrap();
    store
        .update_status(finished.id, SessionStatus::Completed, None, NOW - 4 * 3600)
        .await
        .unwrap();

    let ids = store.mark_stale_as_stopped(7200, NOW).await.unwrap();
    assert_eq!(ids, vec![stale.id]);

    let row = store.get(stale.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Stopped);
    assert_eq!(row.completed_at, Some(NOW));
    assert!(row.notes.contains("stale"));

    let row = store.get(fresh.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Started);

    let row = store.get(finished.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Completed);

    assert!(store.mark_stale_as_stopped(7200, NOW).await.unwrap().is_empty());
}

#[tokio::test]
async fn mark_active_as_stopped_counts_rows() {
    let store = memory_store().await;
    store.insert(&full_sync(), NOW).await.unwrap();
    let second = store.insert(&full_sync(), NOW + 1).await.unwrap();
    store
        .update_progress(second.id, &ProgressUpdate::default(), NOW + 2)
        .await
        .unwrap();

    assert_eq!(store.mark_active_as_stopped("cleanup", NOW + 3).await.unwrap(), 2);
    assert_eq!(store.count_active().await.unwrap(), 0);
    assert_eq!(store.mark_active_as_stopped("cleanup", NOW + 4).await.unwrap(), 0);
}

#[tokio::test]
async fn history_is_newest_first_and_limited() {
    let store = memory_store().await;
    for offset in 0..5 {
        store.insert(&full_sync(), NOW + offset).await.unwrap();
    }

    let history = store.history(3).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].started_at, NOW + 4);
    assert_eq!(history[2].started_at, NOW + 2);
}

#[tokio::test]
async fn prune_keeps_active_rows() {
    let store = memory_store().await;
    let old_active = store.insert(&full_sync(), NOW - 90 * 86_400).await.unwrap();
    let old_done = store.insert(&full_sync(), NOW - 60 * 86_400).await.unwrap();
    store
        .update_status(old_done.id, SessionStatus::Stopped, None, NOW - 60 * 86_400)
        .await
        .unwrap();
    let recent = store.insert(&full_sync(), NOW).await.unwrap();

    let removed = store.prune_older_than(NOW - 30 * 86_400).await.unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(old_active.id).await.unwrap().is_some());
    assert!(store.get(old_done.id).await.unwrap().is_none());
    assert!(store.get(recent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn date_range_fields_round_trip() {
    let store = memory_store().await;
    let input = NewSession {
        sync_type: SyncType::DateRange,
        source: "dashboard".into(),
        max_records: None,
        start_date: Some("2024-01-01".into()),
        end_date: Some("2024-02-01".into()),
        query_filter: Some("after:2024-01-01".into()),
        notes: String::new(),
    };
    let session = store.insert(&input, NOW).await.unwrap();

    assert_eq!(session.sync_type, SyncType::DateRange);
    assert_eq!(session.start_date.as_deref(), Some("2024-01-01"));
    assert_eq!(session.query_filter.as_deref(), Some("after:2024-01-01"));
    assert!(session.max_records.is_none());
}

#[tokio::test]
async fn file_backed_store_persists_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("sessions.db").display());

    let store = SessionStore::new(&url).await.unwrap();
    let session = store.insert(&full_sync(), NOW).await.unwrap();
    store.close().await;

    let reopened = SessionStore::new(&url).await.unwrap();
    let row = reopened.get(session.id).await.unwrap().unwrap();
    assert_eq!(row.sync_type, SyncType::Full);
}

#[tokio::test]
async fn closed_store_reports_errors() {
    let store = memory_store().await;
    store.close().await;

    assert!(store.count_active().await.is_err());
    assert!(store.find_active().await.is_err());
}

#[test]
fn parse_rejects_unknown_values() {
    assert!(matches!(
        SyncType::parse("weekly"),
        Err(SessionStoreError::InvalidSyncType(_))
    ));
    assert!(matches!(
        SessionStatus::parse("paused"),
        Err(SessionStoreError::InvalidStatus(_))
    ));
    assert_eq!(SyncType::parse("date-range").unwrap(), SyncType::DateRange);
}

#[tokio::test]
async fn complete_after_stop_leaves_counters_alone() {
    let store = memory_store().await;
    let session = store.insert(&full_sync(), NOW).await.unwrap();
    store
        .update_status(session.id, SessionStatus::Stopped, Some("user stop"), NOW + 5)
        .await
        .unwrap();

    let counts = ProgressUpdate {
        records_processed: Some(1000),
        records_synced: Some(990),
        ..ProgressUpdate::default()
    };
    assert!(!store.complete(session.id, &counts, NOW + 10).await.unwrap());

    let row = store.get(session.id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Stopped);
    assert_eq!(row.records_processed, 0);
    assert_eq!(row.records_synced, 0);
    assert_eq!(row.completed_at, Some(NOW + 5));
}
