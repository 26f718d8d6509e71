//! Runs against a live Redis: `REDIS_URL=redis://127.0.0.1/ cargo test -p quay-core --features redis -- --ignored`
#![cfg(feature = "redis")]

use quay_core::{
    processor_fn, BulkJob, JobOptions, JobState, JobStatus, QueueConfig, QueueRegistry,
    RedisConnection,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

/// Registry under a prefix no other test run shares
fn registry(test: &str) -> (QueueRegistry, String) {
    let prefix = format!("quay-test:{}:{}", test, chrono::Utc::now().timestamp_micros());
    let connection = RedisConnection::open(&redis_url()).unwrap();
    (QueueRegistry::with_connection(Arc::new(connection), prefix.clone()), prefix)
}

async fn cleanup(prefix: &str) {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_async_connection().await.unwrap();
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{}:*", prefix))
        .query_async(&mut conn)
        .await
        .unwrap();
    if !keys.is_empty() {
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<_, ()>(&mut conn)
            .await
            .unwrap();
    }
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn jobs_are_stored_and_listed_by_state() {
    let (registry, prefix) = registry("listing");
    let emails = registry.add_queue(QueueConfig::new("emails")).unwrap();

    let first = emails.add(json!({ "to": "a@b.com" }), None).await.unwrap();
    let urgent = emails
        .add(json!({ "to": "boss@b.com" }), Some(JobOptions::new().priority(1)))
        .await
        .unwrap();
    let later = emails
        .add(json!({}), Some(JobOptions::new().delay(Duration::from_secs(60))))
        .await
        .unwrap();
    assert_eq!(later.state, JobState::Delayed);

    let stored = emails.get_job(&first.id).await.unwrap().unwrap();
    assert_eq!(stored.data, json!({ "to": "a@b.com" }));
    assert!(emails.get_job("missing").await.unwrap().is_none());

    let waiting = emails.get_jobs(JobStatus::Waiting).await.unwrap();
    let ids: Vec<&str> = waiting.iter().map(|job| job.id.as_str()).collect();
    assert_eq!(ids, vec![urgent.id.as_str(), first.id.as_str()]);
    assert_eq!(emails.get_jobs("delayed").await.unwrap()[0].id, later.id);

    let counts = emails.get_job_counts().await.unwrap();
    assert_eq!((counts.waiting, counts.delayed), (2, 1));

    let bulk = emails
        .add_bulk(vec![BulkJob::new(json!({ "n": 1 })), BulkJob::new(json!({ "n": 2 }))])
        .await
        .unwrap();
    assert_eq!(bulk[1].data, json!({ "n": 2 }));

    registry.close().await.unwrap();
    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn custom_job_id_returns_existing_job() {
    let (registry, prefix) = registry("dedupe");
    let emails = registry.add_queue(QueueConfig::new("emails")).unwrap();

    emails
        .add(json!({ "n": 1 }), Some(JobOptions::new().job_id("welcome-42")))
        .await
        .unwrap();
    let again = emails
        .add(json!({ "n": 2 }), Some(JobOptions::new().job_id("welcome-42")))
        .await
        .unwrap();

    assert_eq!(again.data, json!({ "n": 1 }));
    assert_eq!(emails.get_job_counts().await.unwrap().waiting, 1);

    registry.close().await.unwrap();
    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn add_cron_is_idempotent_and_removable() {
    let (registry, prefix) = registry("cron");
    let reports = registry.add_queue(QueueConfig::new("reports")).unwrap();

    let first = reports
        .add_cron("daily-report", json!({ "kind": "daily" }), "0 0 * * *", None)
        .await
        .unwrap();
    let again = reports
        .add_cron("daily-report", json!({ "kind": "daily" }), "0 0 * * *", None)
        .await
        .unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(first.repeat_key.as_deref(), Some("daily-report::0 0 * * *"));
    assert_eq!(reports.get_jobs("delayed").await.unwrap().len(), 1);

    assert!(reports.remove_repeatable("daily-report", "0 0 * * *").await.unwrap());
    assert!(!reports.remove_repeatable("daily-report", "0 0 * * *").await.unwrap());
    assert!(reports.get_jobs("delayed").await.unwrap().is_empty());

    registry.close().await.unwrap();
    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn worker_honours_pause_and_completes_after_resume() {
    let (registry, prefix) = registry("worker");
    let emails = registry
        .add_queue(
            QueueConfig::new("emails")
                .processor(processor_fn(|job| async move { Ok(json!({ "echo": job.data })) }))
                .concurrency(2),
        )
        .unwrap();
    registry.initialize().await.unwrap();

    emails.pause().await.unwrap();
    assert!(emails.is_paused().await.unwrap());
    let job = emails.add(json!({ "to": "a@b.com" }), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(emails.get_job_counts().await.unwrap().waiting, 1);

    emails.resume().await.unwrap();
    let mut done = None;
    for _ in 0..100 {
        let current = emails.get_job(&job.id).await.unwrap().unwrap();
        if current.state == JobState::Completed {
            done = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let done = done.expect("job was not processed after resume");
    assert_eq!(done.return_value, Some(json!({ "echo": { "to": "a@b.com" } })));
    assert_eq!(emails.get_jobs("completed").await.unwrap().len(), 1);

    registry.close().await.unwrap();
    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore = "requires a running Redis (set REDIS_URL)"]
async fn due_delayed_jobs_are_promoted() {
    let (registry, prefix) = registry("promote");
    let emails = registry
        .add_queue(QueueConfig::new("emails").processor(processor_fn(|job| async move { Ok(job.data) })))
        .unwrap();
    registry.initialize().await.unwrap();

    emails
        .add(json!({}), Some(JobOptions::new().delay(Duration::from_millis(200))))
        .await
        .unwrap();

    let mut completed = 0;
    for _ in 0..100 {
        completed = emails.get_job_counts().await.unwrap().completed;
        if completed == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(completed, 1);
    assert_eq!(emails.get_job_counts().await.unwrap().delayed, 0);

    registry.close().await.unwrap();
    cleanup(&prefix).await;
}
