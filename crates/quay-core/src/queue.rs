//! Named queue wrapper
//!
//! A [`NamedQueue`] owns the queue handle for one name and, once initialized
//! with a processor, the worker and event-stream handles for the same name.

use crate::config::QueueConfig;
use crate::engine::{
    Connection, ErrorObserver, EventStream, NewJob, QueueBackend, QueueSpec, WorkerBackend,
    WorkerError,
};
use crate::error::{QueueError, Result};
use crate::job::{BulkJob, Job, JobCounts, JobOptions, JobStatus, QueueEvent, RepeatOptions};
use crate::processor::{Processor, SandboxedProcessor};
use crate::repeat;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Lifecycle of a [`NamedQueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Queue handle only
    Created,
    /// Worker and events started (when a processor is configured)
    Initialized,
    /// Every handle released; terminal
    Closed,
}

struct Lifecycle {
    state: QueueState,
    worker: Option<Box<dyn WorkerBackend>>,
    events: Option<Box<dyn EventStream>>,
}

/// One queue name with its queue, worker and event-stream handles
pub struct NamedQueue {
    spec: QueueSpec,
    connection: Arc<dyn Connection>,
    queue: Arc<dyn QueueBackend>,
    processor: Option<Processor>,
    concurrency: usize,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for NamedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedQueue")
            .field("name", &self.spec.name)
            .field("prefix", &self.spec.prefix)
            .field("has_processor", &self.processor.is_some())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl NamedQueue {
    /// Build the wrapper and its queue handle. Performs no I/O.
    pub fn new(config: QueueConfig, connection: Arc<dyn Connection>, prefix: &str) -> Result<Self> {
        config.validate()?;

        let spec = QueueSpec::new(config.name, prefix, config.options);
        let queue = connection.queue(&spec)?;

        // an inline processor wins over a processor path
        let processor = match (config.processor, config.processor_path) {
            (Some(processor), _) => Some(processor),
            (None, Some(path)) => Some(Arc::new(SandboxedProcessor::new(path)) as Processor),
            (None, None) => None,
        };

        Ok(Self {
            spec,
            connection,
            queue,
            processor,
            concurrency: config.concurrency,
            lifecycle: Mutex::new(Lifecycle {
                state: QueueState::Created,
                worker: None,
                events: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn prefix(&self) -> &str {
        &self.spec.prefix
    }

    pub fn has_processor(&self) -> bool {
        self.processor.is_some()
    }

    fn job_options(&self, opts: Option<JobOptions>) -> JobOptions {
        opts.unwrap_or_else(|| self.spec.options.default_job_options.clone())
    }

    /// Enqueue one job named after the queue
    pub async fn add(&self, data: serde_json::Value, opts: Option<JobOptions>) -> Result<Job> {
        self.queue
            .add(NewJob {
                name: self.spec.name.clone(),
                data,
                opts: self.job_options(opts),
            })
            .await
    }

    /// Enqueue many jobs; the returned jobs follow the input order.
    ///
    /// Options are validated up front, so an invalid entry adds nothing.
    pub async fn add_bulk(&self, jobs: Vec<BulkJob>) -> Result<Vec<Job>> {
        let jobs: Vec<NewJob> = jobs
            .into_iter()
            .map(|job| NewJob {
                name: self.spec.name.clone(),
                data: job.data,
                opts: self.job_options(job.opts),
            })
            .collect();
        for job in &jobs {
            job.opts.validate()?;
        }
        self.queue.add_bulk(jobs).await
    }

    /// Register a repeatable job under `job_name`.
    ///
    /// The returned job is the first scheduled run. Registering the same name
    /// and pattern again updates the existing definition. A `repeat` set in
    /// `opts` takes precedence over `cron`.
    pub async fn add_cron(
        &self,
        job_name: impl Into<String>,
        data: serde_json::Value,
        cron: &str,
        opts: Option<JobOptions>,
    ) -> Result<Job> {
        let mut opts = self.job_options(opts);
        let repeat = opts
            .repeat
            .take()
            .unwrap_or_else(|| RepeatOptions::cron(cron));
        repeat::parse_schedule(&repeat.pattern)?;
        opts.repeat = Some(repeat);

        self.queue
            .add(NewJob {
                name: job_name.into(),
                data,
                opts,
            })
            .await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.queue.get_job(id).await
    }

    /// Jobs in one state
    ///
    /// Accepts a [`JobStatus`] or a status string; unknown strings fail with
    /// [`QueueError::InvalidStatus`].
    pub async fn get_jobs<S>(&self, status: S) -> Result<Vec<Job>>
    where
        S: TryInto<JobStatus>,
        QueueError: From<S::Error>,
    {
        let status = status.try_into()?;
        self.queue.get_jobs(status).await
    }

    pub async fn get_job_counts(&self) -> Result<JobCounts> {
        self.queue.get_job_counts().await
    }

    /// Cancel the repeatable job registered with `job_name` and `cron`
    pub async fn remove_repeatable(&self, job_name: &str, cron: &str) -> Result<bool> {
        self.queue
            .remove_repeatable(job_name, &RepeatOptions::cron(cron))
            .await
    }

    /// Stop workers on this queue name from taking new jobs
    pub async fn pause(&self) -> Result<()> {
        self.queue.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.queue.resume().await
    }

    pub async fn is_paused(&self) -> Result<bool> {
        self.queue.is_paused().await
    }

    /// Start the worker and event stream when a processor is configured.
    ///
    /// Calling it again once initialized is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            QueueState::Initialized => return Ok(()),
            QueueState::Closed => return Err(QueueError::Closed(self.spec.name.clone())),
            QueueState::Created => {}
        }

        let Some(processor) = self.processor.clone() else {
            tracing::debug!(queue = %self.spec.name, "No processor configured, skipping worker");
            lifecycle.state = QueueState::Initialized;
            return Ok(());
        };

        let on_error: ErrorObserver = Arc::new(|error: &WorkerError| {
            tracing::error!(
                queue = %error.queue,
                job_id = ?error.job_id,
                error = %error.message,
                "Job processing failed"
            );
        });
        let worker = self
            .connection
            .worker(&self.spec, processor, self.concurrency, on_error)
            .await?;

        let events = match self.connection.events(&self.spec).await {
            Ok(events) => events,
            Err(e) => {
                if let Err(close_err) = worker.close().await {
                    tracing::warn!(queue = %self.spec.name, error = %close_err, "Failed to stop worker");
                }
                return Err(e);
            }
        };

        lifecycle.worker = Some(worker);
        lifecycle.events = Some(events);
        lifecycle.state = QueueState::Initialized;

        tracing::info!(
            queue = %self.spec.name,
            concurrency = self.concurrency,
            backend = self.connection.backend(),
            "Queue worker started"
        );
        Ok(())
    }

    /// Release the worker, then the event stream, then the queue handle.
    ///
    /// Every handle is released even if an earlier one fails; the first error
    /// is returned. Closing a closed queue is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == QueueState::Closed {
            return Ok(());
        }
        lifecycle.state = QueueState::Closed;

        let mut first_error = None;
        if let Some(worker) = lifecycle.worker.take() {
            if let Err(e) = worker.close().await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(events) = lifecycle.events.take() {
            if let Err(e) = events.close().await {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.queue.close().await {
            first_error.get_or_insert(e);
        }

        tracing::debug!(queue = %self.spec.name, "Queue closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn state(&self) -> QueueState {
        self.lifecycle.lock().await.state
    }

    pub async fn has_worker(&self) -> bool {
        self.lifecycle.lock().await.worker.is_some()
    }

    pub async fn has_events(&self) -> bool {
        self.lifecycle.lock().await.events.is_some()
    }

    /// Receiver for job lifecycle events; `None` without an event stream
    pub async fn subscribe(&self) -> Option<broadcast::Receiver<QueueEvent>> {
        self.lifecycle
            .lock()
            .await
            .events
            .as_ref()
            .map(|events| events.subscribe())
    }
}
