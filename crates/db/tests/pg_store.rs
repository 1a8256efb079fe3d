//! Integration tests for the PostgreSQL job store.
//!
//! These need a reachable database (`DATABASE_URL`); run them with
//! `cargo test -p deployd-db -- --ignored`.

use std::sync::Arc;

use assert_matches::assert_matches;
use deployd_core::job::{JobMutation, JobStatus, OutputStream, INTERNAL_ERROR_EXIT_CODE};
use deployd_db::{JobStore, PgJobStore, StoreError};
use serde_json::json;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn append(stream: OutputStream, line: &str, progress: Option<i16>) -> JobMutation {
    JobMutation::AppendOutput {
        stream,
        line: line.to_string(),
        progress,
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn create_then_get_round_trips(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store
        .create(json!({"worker-replicas": 3, "cluster-name": "c1"}), "nkp create".into())
        .await
        .unwrap();

    let fetched = store.get(job.id).await.unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.status, JobStatus::Pending);
    assert_eq!(
        serde_json::to_string(&fetched.parameters).unwrap(),
        r#"{"worker-replicas":3,"cluster-name":"c1"}"#
    );
    assert_eq!(fetched.exit_code, None);
    assert_eq!(fetched.progress, 0);
}

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn full_lifecycle_appends_output_and_progress(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.create(json!({}), "nkp".into()).await.unwrap();

    store.apply_update(job.id, &JobMutation::MarkRunning).await.unwrap();
    store
        .apply_update(job.id, &append(OutputStream::Stdout, "Progress: 45%", Some(45)))
        .await
        .unwrap();
    store
        .apply_update(job.id, &append(OutputStream::Stdout, "Progress: 145%", Some(145)))
        .await
        .unwrap();
    store
        .apply_update(job.id, &append(OutputStream::Stderr, "warn", None))
        .await
        .unwrap();
    let status = store
        .apply_update(job.id, &JobMutation::Finish { exit_code: 0 })
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Completed);
    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.stdout, "Progress: 45%\nProgress: 145%\n");
    assert_eq!(stored.stderr, "warn\n");
    assert_eq!(stored.progress, 45);
    assert_eq!(stored.exit_code, Some(0));
}

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn terminal_jobs_reject_further_mutations(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let job = store.create(json!({}), "nkp".into()).await.unwrap();
    store.apply_update(job.id, &JobMutation::MarkRunning).await.unwrap();
    store
        .apply_update(
            job.id,
            &JobMutation::Fail {
                exit_code: INTERNAL_ERROR_EXIT_CODE,
                reason: "cancelled".into(),
            },
        )
        .await
        .unwrap();

    assert_matches!(
        store
            .apply_update(job.id, &append(OutputStream::Stdout, "late", None))
            .await,
        Err(StoreError::Conflict(_))
    );
    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.stderr, "cancelled\n");
}

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn unknown_job_is_not_found(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let id = deployd_core::types::new_job_id();
    assert_matches!(store.get(id).await, Err(StoreError::NotFound(_)));
    assert_matches!(
        store.apply_update(id, &JobMutation::MarkRunning).await,
        Err(StoreError::NotFound(_))
    );
}

// ---------------------------------------------------------------------------
// Listing and concurrency
// ---------------------------------------------------------------------------

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn list_is_newest_first(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let a = store.create(json!({}), "a".into()).await.unwrap();
    let b = store.create(json!({}), "b".into()).await.unwrap();

    let ids: Vec<_> = store.list().await.unwrap().into_iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![b.id, a.id]);
}

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn concurrent_appends_are_serialized(pool: PgPool) {
    let store = Arc::new(PgJobStore::new(pool));
    let job = store.create(json!({}), "nkp".into()).await.unwrap();
    store.apply_update(job.id, &JobMutation::MarkRunning).await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .apply_update(job.id, &append(OutputStream::Stdout, &format!("l{i}"), None))
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.stdout.lines().count(), 20);
}

#[ignore = "requires DATABASE_URL"]
#[sqlx::test(migrations = "../../db/migrations")]
async fn unfinished_jobs_are_failed_on_startup(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let pending = store.create(json!({}), "a".into()).await.unwrap();
    let running = store.create(json!({}), "b".into()).await.unwrap();
    store.apply_update(running.id, &JobMutation::MarkRunning).await.unwrap();

    assert_eq!(store.fail_unfinished("Job interrupted by restart").await.unwrap(), 2);
    for id in [pending.id, running.id] {
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.exit_code, Some(INTERNAL_ERROR_EXIT_CODE));
        assert_eq!(job.stderr, "Job interrupted by restart\n");
    }
}
