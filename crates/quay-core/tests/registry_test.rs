use async_trait::async_trait;
use quay_core::engine::{
    Connection, ErrorObserver, EventStream, NewJob, QueueBackend, QueueSpec, WorkerBackend,
};
use quay_core::{
    processor_fn, Job, JobCounts, JobStatus, MemoryConnection, Processor, QueueConfig, QueueError,
    QueueRegistry, QueueState, QueuesConfig, RepeatOptions, Result,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

fn echo() -> Processor {
    processor_fn(|job| async move { Ok(job.data) })
}

/// Connection that records every release in order
#[derive(Clone, Default)]
struct RecordingConnection {
    log: Arc<Mutex<Vec<String>>>,
    fail_worker: Arc<Mutex<Option<String>>>,
    fail_close: Arc<Mutex<Option<String>>>,
}

impl RecordingConnection {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn fail_worker_for(&self, name: &str) {
        *self.fail_worker.lock().unwrap() = Some(name.to_string());
    }

    fn fail_close_for(&self, name: &str) {
        *self.fail_close.lock().unwrap() = Some(name.to_string());
    }
}

struct RecordingQueue {
    name: String,
    conn: RecordingConnection,
}

#[async_trait]
impl QueueBackend for RecordingQueue {
    async fn add(&self, _job: NewJob) -> Result<Job> {
        Err(QueueError::engine("not supported"))
    }

    async fn get_job(&self, _id: &str) -> Result<Option<Job>> {
        Ok(None)
    }

    async fn get_jobs(&self, _status: JobStatus) -> Result<Vec<Job>> {
        Ok(Vec::new())
    }

    async fn get_job_counts(&self) -> Result<JobCounts> {
        Ok(JobCounts::default())
    }

    async fn remove_repeatable(&self, _name: &str, _repeat: &RepeatOptions) -> Result<bool> {
        Ok(false)
    }

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(false)
    }

    async fn close(&self) -> Result<()> {
        self.conn.push(format!("queue:{}", self.name));
        if self.conn.fail_close.lock().unwrap().as_deref() == Some(self.name.as_str()) {
            return Err(QueueError::engine("close refused"));
        }
        Ok(())
    }
}

struct RecordingWorker {
    name: String,
    conn: RecordingConnection,
}

#[async_trait]
impl WorkerBackend for RecordingWorker {
    async fn close(&self) -> Result<()> {
        self.conn.push(format!("worker:{}", self.name));
        Ok(())
    }
}

struct RecordingEvents {
    name: String,
    conn: RecordingConnection,
}

#[async_trait]
impl EventStream for RecordingEvents {
    fn subscribe(&self) -> broadcast::Receiver<quay_core::QueueEvent> {
        broadcast::channel(1).1
    }

    async fn close(&self) -> Result<()> {
        self.conn.push(format!("events:{}", self.name));
        Ok(())
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn backend(&self) -> &'static str {
        "recording"
    }

    fn queue(&self, spec: &QueueSpec) -> Result<Arc<dyn QueueBackend>> {
        Ok(Arc::new(RecordingQueue {
            name: spec.name.clone(),
            conn: self.clone(),
        }))
    }

    async fn worker(
        &self,
        spec: &QueueSpec,
        _processor: Processor,
        _concurrency: usize,
        _on_error: ErrorObserver,
    ) -> Result<Box<dyn WorkerBackend>> {
        if self.fail_worker.lock().unwrap().as_deref() == Some(spec.name.as_str()) {
            return Err(QueueError::engine("store unreachable"));
        }
        Ok(Box::new(RecordingWorker {
            name: spec.name.clone(),
            conn: self.clone(),
        }))
    }

    async fn events(&self, spec: &QueueSpec) -> Result<Box<dyn EventStream>> {
        Ok(Box::new(RecordingEvents {
            name: spec.name.clone(),
            conn: self.clone(),
        }))
    }

    async fn quit(&self) -> Result<()> {
        self.push("quit".to_string());
        Ok(())
    }
}

fn recording_registry() -> (QueueRegistry, RecordingConnection) {
    let conn = RecordingConnection::default();
    let registry = QueueRegistry::with_connection(Arc::new(conn.clone()), "test");
    (registry, conn)
}

#[tokio::test]
async fn queue_without_processor_has_no_worker_after_initialize() {
    let registry = QueueRegistry::new(QueuesConfig::new().queue(QueueConfig::new("audit"))).unwrap();
    registry.initialize().await.unwrap();

    let queue = registry.get_queue("audit").unwrap();
    assert_eq!(queue.state().await, QueueState::Initialized);
    assert!(!queue.has_worker().await);
    assert!(!queue.has_events().await);
    assert!(queue.subscribe().await.is_none());

    registry.close().await.unwrap();
}

#[tokio::test]
async fn queue_with_processor_gets_worker_and_events() {
    let registry = QueueRegistry::new(
        QueuesConfig::new()
            .queue(QueueConfig::new("emails").processor(echo()))
            .queue(QueueConfig::new("reports").processor_path("/bin/cat")),
    )
    .unwrap();

    let emails = registry.get_queue("emails").unwrap();
    assert!(!emails.has_worker().await);

    registry.initialize().await.unwrap();

    for name in ["emails", "reports"] {
        let queue = registry.get_queue(name).unwrap();
        assert!(queue.has_worker().await, "{} has no worker", name);
        assert!(queue.has_events().await, "{} has no events", name);
    }

    registry.close().await.unwrap();
}

#[tokio::test]
async fn unknown_queue_is_not_found() {
    let registry = QueueRegistry::new(QueuesConfig::new()).unwrap();
    let err = registry.get_queue("missing").unwrap_err();
    assert!(matches!(err, QueueError::NotFound(ref name) if name == "missing"));
    assert!(err.is_usage_error());
}

#[tokio::test]
async fn get_queue_returns_the_added_instance() {
    let registry = QueueRegistry::new(QueuesConfig::new()).unwrap();
    let added = registry.add_queue(QueueConfig::new("emails")).unwrap();
    let found = registry.get_queue("emails").unwrap();
    assert!(Arc::ptr_eq(&added, &found));
}

#[tokio::test]
async fn re_adding_a_name_replaces_the_queue() {
    let registry = QueueRegistry::new(QueuesConfig::new()).unwrap();
    let first = registry.add_queue(QueueConfig::new("emails")).unwrap();
    let second = registry.add_queue(QueueConfig::new("emails")).unwrap();

    assert_eq!(registry.len(), 1);
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&second, &registry.get_queue("emails").unwrap()));
}

#[tokio::test]
async fn close_releases_worker_then_events_then_queue() {
    let (registry, conn) = recording_registry();
    let queue = registry
        .add_queue(QueueConfig::new("emails").processor(echo()))
        .unwrap();

    queue.initialize().await.unwrap();
    queue.close().await.unwrap();

    assert_eq!(conn.log(), vec!["worker:emails", "events:emails", "queue:emails"]);
    assert_eq!(queue.state().await, QueueState::Closed);
}

#[tokio::test]
async fn close_without_initialize_only_releases_queue() {
    let (registry, conn) = recording_registry();
    let queue = registry
        .add_queue(QueueConfig::new("emails").processor(echo()))
        .unwrap();

    queue.close().await.unwrap();
    queue.close().await.unwrap();

    assert_eq!(conn.log(), vec!["queue:emails"]);
}

#[tokio::test]
async fn registry_close_quits_connection_once_after_queues() {
    let (registry, conn) = recording_registry();
    registry.add_queue(QueueConfig::new("emails").processor(echo())).unwrap();
    registry.add_queue(QueueConfig::new("audit")).unwrap();
    registry.initialize().await.unwrap();

    registry.close().await.unwrap();
    registry.close().await.unwrap();

    let log = conn.log();
    assert_eq!(log.iter().filter(|e| *e == "quit").count(), 1);
    assert_eq!(log.last().map(String::as_str), Some("quit"));
    assert!(log.contains(&"queue:audit".to_string()));
    assert!(log.contains(&"queue:emails".to_string()));
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let (registry, conn) = recording_registry();
    let queue = registry
        .add_queue(QueueConfig::new("emails").processor(echo()))
        .unwrap();

    queue.initialize().await.unwrap();
    queue.initialize().await.unwrap();
    queue.close().await.unwrap();

    // a second worker would show up as a second release
    assert_eq!(conn.log().iter().filter(|e| *e == "worker:emails").count(), 1);
}

#[tokio::test]
async fn initialize_after_close_is_rejected() {
    let (registry, _conn) = recording_registry();
    let queue = registry
        .add_queue(QueueConfig::new("emails").processor(echo()))
        .unwrap();

    queue.close().await.unwrap();
    let err = queue.initialize().await.unwrap_err();
    assert!(matches!(err, QueueError::Closed(_)));
}

#[tokio::test]
async fn failed_initialize_surfaces_one_error_without_rollback() {
    let (registry, conn) = recording_registry();
    conn.fail_worker_for("reports");
    registry.add_queue(QueueConfig::new("emails").processor(echo())).unwrap();
    registry.add_queue(QueueConfig::new("reports").processor(echo())).unwrap();

    let err = registry.initialize().await.unwrap_err();
    assert!(matches!(err, QueueError::Initialization(_)));

    let emails = registry.get_queue("emails").unwrap();
    let reports = registry.get_queue("reports").unwrap();
    assert_eq!(emails.state().await, QueueState::Initialized);
    assert_eq!(reports.state().await, QueueState::Created);
}

#[tokio::test]
async fn close_failures_are_collected() {
    let (registry, conn) = recording_registry();
    conn.fail_close_for("reports");
    registry.add_queue(QueueConfig::new("emails")).unwrap();
    registry.add_queue(QueueConfig::new("reports")).unwrap();

    let err = registry.close().await.unwrap_err();
    match err {
        QueueError::CloseFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].resource, "reports");
        }
        other => panic!("unexpected error: {other}"),
    }

    // every queue was still closed and the connection released
    let log = conn.log();
    assert!(log.contains(&"queue:emails".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("quit"));
}

#[tokio::test]
async fn added_job_can_be_read_back() {
    let registry = QueueRegistry::new(
        QueuesConfig::new().queue(QueueConfig::new("emails").processor(echo()).concurrency(3)),
    )
    .unwrap();
    registry.initialize().await.unwrap();

    let emails = registry.get_queue("emails").unwrap();
    let job = emails.add(json!({ "to": "a@b.com" }), None).await.unwrap();
    assert!(!job.id.is_empty());
    assert_eq!(job.name, "emails");

    let found = emails.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(found.data, json!({ "to": "a@b.com" }));

    registry.close().await.unwrap();
}

#[tokio::test]
async fn waiting_jobs_of_a_fresh_queue_is_empty() {
    let registry = QueueRegistry::new(QueuesConfig::new().queue(QueueConfig::new("emails"))).unwrap();
    let jobs = registry.get_queue("emails").unwrap().get_jobs("waiting").await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
async fn bogus_status_is_an_error() {
    let registry = QueueRegistry::new(QueuesConfig::new().queue(QueueConfig::new("emails"))).unwrap();
    let err = registry
        .get_queue("emails")
        .unwrap()
        .get_jobs("bogus-status")
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::InvalidStatus(ref s) if s == "bogus-status"));
}

#[tokio::test]
async fn pause_and_resume_keep_queries_working() {
    let registry = QueueRegistry::new(QueuesConfig::new().queue(QueueConfig::new("emails"))).unwrap();
    let emails = registry.get_queue("emails").unwrap();

    emails.pause().await.unwrap();
    assert!(emails.is_paused().await.unwrap());
    assert!(emails.get_jobs(JobStatus::Waiting).await.unwrap().is_empty());

    emails.resume().await.unwrap();
    assert!(!emails.is_paused().await.unwrap());
    assert!(emails.get_jobs("completed").await.unwrap().is_empty());
}

#[tokio::test]
async fn queue_handles_fail_after_close() {
    let conn = MemoryConnection::new();
    let registry = QueueRegistry::with_connection(Arc::new(conn.clone()), "test");
    let emails = registry.add_queue(QueueConfig::new("emails")).unwrap();

    registry.close().await.unwrap();
    assert!(conn.is_quit());

    let err = emails.add(json!({}), None).await.unwrap_err();
    assert!(matches!(err, QueueError::Closed(_)));
}

#[tokio::test]
async fn invalid_queue_config_is_rejected() {
    let registry = QueueRegistry::new(QueuesConfig::new()).unwrap();
    assert!(matches!(
        registry.add_queue(QueueConfig::new("")),
        Err(QueueError::Config(_))
    ));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn queue_names_are_sorted() {
    let registry = QueueRegistry::new(
        QueuesConfig::new()
            .queue(QueueConfig::new("reports"))
            .queue(QueueConfig::new("emails")),
    )
    .unwrap();
    assert_eq!(registry.queue_names(), vec!["emails", "reports"]);
    assert_eq!(registry.prefix(), "quay");
}
