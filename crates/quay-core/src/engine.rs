//! The seam between the coordination layer and a queue engine.
//!
//! A [`Connection`] is the single shared client to the store. Every named
//! queue asks it for a queue handle, and, once initialized with a processor,
//! for a worker handle and an event stream on the same queue name.

use crate::config::QueueOptions;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobCounts, JobOptions, JobStatus, QueueEvent, RepeatOptions};
use crate::processor::Processor;
use async_trait::async_trait;
use futures_util::{FutureExt, Stream, StreamExt};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

/// Capacity of per-stream event buffers
pub(crate) const EVENT_BUFFER: usize = 256;

/// Poll interval of idle workers
pub(crate) const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Pause of a worker slot after the engine failed to hand out a job
const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Identity of one queue inside a connection
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    /// Namespace for every key the engine creates for this queue
    pub prefix: String,
    pub options: QueueOptions,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>, options: QueueOptions) -> Self {
        let prefix = prefix.into();
        Self {
            name: name.into(),
            prefix: options.prefix.clone().unwrap_or(prefix),
            options,
        }
    }

    /// Fully qualified key of this queue, `{prefix}:{name}`
    pub fn key(&self) -> String {
        format!("{}:{}", self.prefix, self.name)
    }
}

/// A job to be enqueued
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
}

/// Shared client to the store backing the queue engine
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Create the queue handle for `spec`. Never performs I/O.
    fn queue(&self, spec: &QueueSpec) -> Result<Arc<dyn QueueBackend>>;

    /// Start a worker running `processor` on up to `concurrency` jobs at once.
    ///
    /// `on_error` receives every background processing error, including
    /// those raised before this call returns.
    async fn worker(
        &self,
        spec: &QueueSpec,
        processor: Processor,
        concurrency: usize,
        on_error: ErrorObserver,
    ) -> Result<Box<dyn WorkerBackend>>;

    /// Subscribe to job lifecycle events of `spec`
    async fn events(&self, spec: &QueueSpec) -> Result<Box<dyn EventStream>>;

    /// Release the connection. Handles created from it stop working.
    async fn quit(&self) -> Result<()>;
}

/// Engine-side queue operations
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn add(&self, job: NewJob) -> Result<Job>;

    /// Enqueue many jobs; the result keeps the input order
    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>> {
        let mut added = Vec::with_capacity(jobs.len());
        for job in jobs {
            added.push(self.add(job).await?);
        }
        Ok(added)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>>;

    async fn get_jobs(&self, status: JobStatus) -> Result<Vec<Job>>;

    async fn get_job_counts(&self) -> Result<JobCounts>;

    /// Cancel a repeatable definition; returns whether one existed
    async fn remove_repeatable(&self, name: &str, repeat: &RepeatOptions) -> Result<bool>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn is_paused(&self) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

/// A processing error raised in the background by a worker
#[derive(Debug, Clone)]
pub struct WorkerError {
    pub queue: String,
    pub job_id: Option<String>,
    pub message: String,
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.job_id {
            Some(id) => write!(f, "job {} in queue {}: {}", id, self.queue, self.message),
            None => write!(f, "queue {}: {}", self.queue, self.message),
        }
    }
}

/// Callback invoked for every background worker error
pub type ErrorObserver = Arc<dyn Fn(&WorkerError) + Send + Sync>;

/// A running worker
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Stop taking jobs and wait for in-flight jobs to finish
    async fn close(&self) -> Result<()>;
}

/// A subscription to queue events
#[async_trait]
pub trait EventStream: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent>;

    async fn close(&self) -> Result<()>;
}

/// Worker-side job transitions of an engine
#[async_trait]
pub(crate) trait JobSource: Send + Sync + 'static {
    fn queue_name(&self) -> &str;

    /// Take the next runnable job, marking it active
    async fn fetch_next(&self) -> Result<Option<Job>>;

    async fn complete(&self, id: &str, value: serde_json::Value) -> Result<()>;

    /// Record a failed attempt, scheduling a retry when attempts remain
    async fn fail(&self, id: &str, reason: String) -> Result<()>;

    /// Resolves when a job may have become available
    async fn idle(&self) {
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Worker running one task per concurrency slot over a [`JobSource`]
pub(crate) struct SlotWorker {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SlotWorker {
    pub(crate) fn spawn<S: JobSource>(
        source: Arc<S>,
        processor: Processor,
        concurrency: usize,
        on_error: ErrorObserver,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let tasks = (0..concurrency.max(1))
            .map(|slot| {
                tokio::spawn(slot_loop(
                    slot,
                    source.clone(),
                    processor.clone(),
                    on_error.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Self {
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }
}

#[async_trait]
impl WorkerBackend for SlotWorker {
    async fn close(&self) -> Result<()> {
        // receivers may already be gone
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .map_err(|_| QueueError::engine("Lock poisoned"))?,
        );
        for task in tasks {
            task.await
                .map_err(|e| QueueError::engine(format!("worker task failed: {}", e)))?;
        }
        Ok(())
    }
}

async fn slot_loop<S: JobSource>(
    slot: usize,
    source: Arc<S>,
    processor: Processor,
    on_error: ErrorObserver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let queue = source.queue_name().to_string();
    let report = |job_id: Option<String>, message: String| {
        on_error(&WorkerError {
            queue: queue.clone(),
            job_id,
            message,
        })
    };
    tracing::debug!(queue = %queue, slot, "Worker slot started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let job = match source.fetch_next().await {
            Ok(job) => job,
            Err(e) => {
                report(None, e.to_string());
                tokio::select! {
                    changed = shutdown_rx.changed() => if changed.is_err() { break },
                    _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                }
                continue;
            }
        };

        let Some(job) = job else {
            tokio::select! {
                changed = shutdown_rx.changed() => if changed.is_err() { break },
                _ = source.idle() => {}
            }
            continue;
        };

        let job_id = job.id.clone();
        let outcome = AssertUnwindSafe(processor.process(job)).catch_unwind().await;
        let settled = match outcome {
            Ok(Ok(value)) => source.complete(&job_id, value).await,
            Ok(Err(e)) => {
                let message = e.to_string();
                report(Some(job_id.clone()), message.clone());
                source.fail(&job_id, message).await
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                report(Some(job_id.clone()), message.clone());
                source.fail(&job_id, message).await
            }
        };

        if let Err(e) = settled {
            report(Some(job_id), e.to_string());
        }
    }

    tracing::debug!(queue = %queue, slot, "Worker slot stopped");
}

/// Event stream fed by a background task.
///
/// Closing aborts the task and drops the sender, so receivers observe
/// `RecvError::Closed` once they have drained buffered events.
pub(crate) struct EventRelay {
    sender: Mutex<Option<broadcast::Sender<QueueEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventRelay {
    pub(crate) fn spawn<S>(source: S) -> Self
    where
        S: Stream<Item = QueueEvent> + Send + 'static,
    {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        let forward = sender.clone();
        let task = tokio::spawn(async move {
            futures_util::pin_mut!(source);
            while let Some(event) = source.next().await {
                // no subscribers is fine
                let _ = forward.send(event);
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            task: Mutex::new(Some(task)),
        }
    }
}

#[async_trait]
impl EventStream for EventRelay {
    fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        match self.sender.lock().ok().and_then(|s| s.as_ref().map(|s| s.subscribe())) {
            Some(receiver) => receiver,
            None => broadcast::channel(1).1,
        }
    }

    async fn close(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .map_err(|_| QueueError::engine("event relay lock poisoned"))?
            .take();
        if let Some(task) = task {
            task.abort();
            // cancelled is the expected outcome
            let _ = task.await;
        }
        self.sender
            .lock()
            .map_err(|_| QueueError::engine("event relay lock poisoned"))?
            .take();
        Ok(())
    }
}

/// Turn a broadcast receiver into a stream, skipping over lag
pub(crate) fn receiver_stream(
    receiver: broadcast::Receiver<QueueEvent>,
) -> impl Stream<Item = QueueEvent> + Send + 'static {
    futures_util::stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(event) => return Some((event, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Best-effort message of a caught panic payload
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "processor panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_spec_prefers_the_queue_prefix() {
        let spec = QueueSpec::new("emails", "quay", QueueOptions::new().prefix("tenant-a"));
        assert_eq!(spec.key(), "tenant-a:emails");
        assert_eq!(spec.clone(), spec);
        assert_ne!(spec, QueueSpec::new("emails", "quay", QueueOptions::new()));
    }

    #[test]
    fn worker_error_names_the_job() {
        let error = WorkerError {
            queue: "emails".into(),
            job_id: Some("7".into()),
            message: "smtp refused".into(),
        };
        assert_eq!(error.to_string(), "job 7 in queue emails: smtp refused");
    }
}
