use super::{
    receiver_stream, Connection, ErrorObserver, EventRelay, EventStream, JobSource, NewJob,
    QueueBackend, QueueSpec, SlotWorker, WorkerBackend, EVENT_BUFFER, POLL_INTERVAL,
};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobCounts, JobState, JobStatus, QueueEvent, RepeatOptions};
use crate::processor::Processor;
use crate::repeat;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};

/// In-process queue engine (not persistent, for development and tests)
///
/// Queue, worker and event handles created for the same queue key share one
/// store, the way separate clients of a real store would.
#[derive(Clone, Default)]
pub struct MemoryConnection {
    stores: Arc<Mutex<HashMap<String, Arc<QueueStore>>>>,
    quit: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `quit` has been called
    pub fn is_quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    fn store(&self, spec: &QueueSpec) -> Result<Arc<QueueStore>> {
        if self.is_quit() {
            return Err(QueueError::engine("connection is closed"));
        }
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| QueueError::engine("Lock poisoned"))?;
        Ok(stores
            .entry(spec.key())
            .or_insert_with(|| Arc::new(QueueStore::new(&spec.name)))
            .clone())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn queue(&self, spec: &QueueSpec) -> Result<Arc<dyn QueueBackend>> {
        Ok(Arc::new(MemoryQueue {
            store: self.store(spec)?,
            connection_quit: self.quit.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn worker(
        &self,
        spec: &QueueSpec,
        processor: Processor,
        concurrency: usize,
        on_error: ErrorObserver,
    ) -> Result<Box<dyn WorkerBackend>> {
        Ok(Box::new(SlotWorker::spawn(
            self.store(spec)?,
            processor,
            concurrency,
            on_error,
        )))
    }

    async fn events(&self, spec: &QueueSpec) -> Result<Box<dyn EventStream>> {
        let store = self.store(spec)?;
        Ok(Box::new(EventRelay::spawn(receiver_stream(
            store.events.subscribe(),
        ))))
    }

    async fn quit(&self) -> Result<()> {
        self.quit.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct Repeatable {
    name: String,
    data: serde_json::Value,
    opts: crate::job::JobOptions,
    materialized: u32,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<String, Job>,
    waiting: VecDeque<String>,
    active: Vec<String>,
    delayed: Vec<String>,
    completed: Vec<String>,
    failed: Vec<String>,
    repeatables: HashMap<String, Repeatable>,
    paused: bool,
    next_id: u64,
}

impl StoreState {
    fn ids(&self, state: JobState) -> Vec<String> {
        match state {
            JobState::Waiting => self.waiting.iter().cloned().collect(),
            JobState::Active => self.active.clone(),
            JobState::Delayed => self.delayed.clone(),
            JobState::Completed => self.completed.clone(),
            JobState::Failed => self.failed.clone(),
        }
    }

    fn enqueue_waiting(&mut self, id: String) {
        let priority = self.jobs.get(&id).map(|j| j.opts.priority).unwrap_or(0);
        if priority == 0 {
            self.waiting.push_back(id);
            return;
        }
        let position = self.waiting.iter().position(|other| {
            let p = self.jobs.get(other).map(|j| j.opts.priority).unwrap_or(0);
            p == 0 || p > priority
        });
        match position {
            Some(at) => self.waiting.insert(at, id),
            None => self.waiting.push_back(id),
        }
    }
}

/// State of one queue key
pub(crate) struct QueueStore {
    name: String,
    state: Mutex<StoreState>,
    notify: Notify,
    events: broadcast::Sender<QueueEvent>,
}

impl QueueStore {
    fn new(name: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            name: name.to_string(),
            state: Mutex::new(StoreState::default()),
            notify: Notify::new(),
            events,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| QueueError::engine("Lock poisoned"))
    }

    fn emit(&self, event: QueueEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn add(&self, job: NewJob) -> Result<Job> {
        if let Some(repeat) = job.opts.repeat.clone() {
            return self.add_repeatable(job, repeat);
        }
        job.opts.validate()?;
        let run_at = job.opts.delayed_until(Utc::now())?;

        let mut state = self.lock()?;
        let id = match &job.opts.job_id {
            Some(id) => id.clone(),
            None => {
                state.next_id += 1;
                state.next_id.to_string()
            }
        };
        if let Some(existing) = state.jobs.get(&id) {
            return Ok(existing.clone());
        }

        let mut record = Job::new(id.clone(), job.name, job.data, job.opts);
        let added = QueueEvent::Added {
            queue: self.name.clone(),
            job_id: id.clone(),
            name: record.name.clone(),
        };

        let follow_up = if let Some(run_at) = run_at {
            record.state = JobState::Delayed;
            record.run_at = Some(run_at);
            state.jobs.insert(id.clone(), record.clone());
            state.delayed.push(id.clone());
            QueueEvent::Delayed {
                queue: self.name.clone(),
                job_id: id,
                run_at,
            }
        } else {
            state.jobs.insert(id.clone(), record.clone());
            state.enqueue_waiting(id.clone());
            QueueEvent::Waiting {
                queue: self.name.clone(),
                job_id: id,
            }
        };
        drop(state);

        self.emit(added);
        self.emit(follow_up);
        self.notify.notify_waiters();
        Ok(record)
    }

    fn add_repeatable(&self, job: NewJob, repeat: RepeatOptions) -> Result<Job> {
        job.opts.validate()?;
        let key = repeat::repeat_key(&job.name, &repeat.pattern);
        let run_at = repeat::next_run(&repeat.pattern, Utc::now())?.ok_or_else(|| {
            QueueError::InvalidCron {
                pattern: repeat.pattern.clone(),
                reason: "schedule has no upcoming run".to_string(),
            }
        })?;

        let mut state = self.lock()?;
        let materialized = state
            .repeatables
            .get(&key)
            .map(|r| r.materialized)
            .unwrap_or(0);
        state.repeatables.insert(
            key.clone(),
            Repeatable {
                name: job.name,
                data: job.data,
                opts: job.opts,
                materialized,
            },
        );

        let pending = state
            .delayed
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .find(|j| j.repeat_key.as_deref() == Some(key.as_str()))
            .cloned();
        if let Some(pending) = pending {
            return Ok(pending);
        }

        let (record, event) = self
            .materialize(&mut state, &key, run_at)
            .ok_or_else(|| QueueError::engine(format!("repeat limit reached for {}", key)))?;
        drop(state);

        self.emit(event);
        Ok(record)
    }

    /// Create the delayed job of a repeatable definition for `run_at`
    fn materialize(
        &self,
        state: &mut StoreState,
        key: &str,
        run_at: DateTime<Utc>,
    ) -> Option<(Job, QueueEvent)> {
        let repeatable = state.repeatables.get_mut(key)?;
        if let Some(limit) = repeatable.opts.repeat.as_ref().and_then(|r| r.limit) {
            if repeatable.materialized >= limit {
                return None;
            }
        }
        repeatable.materialized += 1;

        let id = repeat::repeat_job_id(key, run_at);
        let mut record = Job::new(
            id.clone(),
            repeatable.name.clone(),
            repeatable.data.clone(),
            repeatable.opts.clone(),
        );
        record.state = JobState::Delayed;
        record.run_at = Some(run_at);
        record.repeat_key = Some(key.to_string());

        state.jobs.insert(id.clone(), record.clone());
        state.delayed.push(id.clone());
        let event = QueueEvent::Delayed {
            queue: self.name.clone(),
            job_id: id,
            run_at,
        };
        Some((record, event))
    }

    /// Move due delayed jobs to waiting, scheduling the next run of repeatables
    fn promote_due(&self, state: &mut StoreState, now: DateTime<Utc>) -> Vec<QueueEvent> {
        let due: Vec<String> = state
            .delayed
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(*id)
                    .and_then(|j| j.run_at)
                    .map(|at| at <= now)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let mut events = Vec::new();
        for id in due {
            state.delayed.retain(|d| d != &id);
            let (repeat_key, pattern, run_at) = match state.jobs.get_mut(&id) {
                Some(job) => {
                    job.state = JobState::Waiting;
                    (
                        job.repeat_key.clone(),
                        job.opts.repeat.as_ref().map(|r| r.pattern.clone()),
                        job.run_at.unwrap_or(now),
                    )
                }
                None => continue,
            };
            state.enqueue_waiting(id.clone());
            events.push(QueueEvent::Waiting {
                queue: self.name.clone(),
                job_id: id,
            });

            if let (Some(key), Some(pattern)) = (repeat_key, pattern) {
                match repeat::next_run(&pattern, run_at.max(now)) {
                    Ok(Some(next)) => {
                        if let Some((_, event)) = self.materialize(state, &key, next) {
                            events.push(event);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(queue = %self.name, error = %e, "Dropping repeatable job"),
                }
            }
        }
        events
    }
}

#[async_trait]
impl JobSource for QueueStore {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn fetch_next(&self) -> Result<Option<Job>> {
        let mut state = self.lock()?;
        let mut events = self.promote_due(&mut state, Utc::now());

        let job = if state.paused {
            None
        } else {
            match state.waiting.pop_front() {
                Some(id) => {
                    state.active.push(id.clone());
                    state.jobs.get_mut(&id).map(|job| {
                        job.state = JobState::Active;
                        job.processed_on = Some(Utc::now());
                        job.attempts_made += 1;
                        events.push(QueueEvent::Active {
                            queue: self.name.clone(),
                            job_id: id.clone(),
                        });
                        job.clone()
                    })
                }
                None => None,
            }
        };
        drop(state);

        for event in events {
            self.emit(event);
        }
        Ok(job)
    }

    async fn complete(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let mut state = self.lock()?;
        state.active.retain(|a| a != id);
        let remove = match state.jobs.get_mut(id) {
            Some(job) => {
                job.state = JobState::Completed;
                job.finished_on = Some(Utc::now());
                job.return_value = Some(value.clone());
                job.opts.remove_on_complete
            }
            None => return Ok(()),
        };
        if remove {
            state.jobs.remove(id);
        } else {
            state.completed.push(id.to_string());
        }
        drop(state);

        self.emit(QueueEvent::Completed {
            queue: self.name.clone(),
            job_id: id.to_string(),
            return_value: value,
        });
        Ok(())
    }

    async fn fail(&self, id: &str, reason: String) -> Result<()> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.active.retain(|a| a != id);
        let (retry, retry_at, remove) = match state.jobs.get_mut(id) {
            Some(job) => {
                job.failed_reason = Some(reason.clone());
                (job.can_retry(), job.opts.retry_at(now), job.opts.remove_on_fail)
            }
            None => return Ok(()),
        };

        let event = if retry {
            match retry_at {
                Some(run_at) => {
                    if let Some(job) = state.jobs.get_mut(id) {
                        job.state = JobState::Delayed;
                        job.run_at = Some(run_at);
                    }
                    state.delayed.push(id.to_string());
                    QueueEvent::Delayed {
                        queue: self.name.clone(),
                        job_id: id.to_string(),
                        run_at,
                    }
                }
                None => {
                    if let Some(job) = state.jobs.get_mut(id) {
                        job.state = JobState::Waiting;
                    }
                    state.enqueue_waiting(id.to_string());
                    QueueEvent::Waiting {
                        queue: self.name.clone(),
                        job_id: id.to_string(),
                    }
                }
            }
        } else {
            if remove {
                state.jobs.remove(id);
            } else {
                if let Some(job) = state.jobs.get_mut(id) {
                    job.state = JobState::Failed;
                    job.finished_on = Some(Utc::now());
                }
                state.failed.push(id.to_string());
            }
            QueueEvent::Failed {
                queue: self.name.clone(),
                job_id: id.to_string(),
                reason,
            }
        };
        drop(state);

        self.emit(event);
        Ok(())
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

/// Queue handle of the memory engine
pub struct MemoryQueue {
    store: Arc<QueueStore>,
    connection_quit: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn store(&self) -> Result<&QueueStore> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.store.name.clone()));
        }
        if self.connection_quit.load(Ordering::SeqCst) {
            return Err(QueueError::engine("connection is closed"));
        }
        Ok(&self.store)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn add(&self, job: NewJob) -> Result<Job> {
        self.store()?.add(job)
    }

    async fn add_bulk(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>> {
        let store = self.store()?;
        jobs.into_iter().map(|job| store.add(job)).collect()
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.store()?.lock()?.jobs.get(id).cloned())
    }

    async fn get_jobs(&self, status: JobStatus) -> Result<Vec<Job>> {
        let store = self.store()?;
        let mut state = store.lock()?;
        let events = store.promote_due(&mut state, Utc::now());
        let jobs: Vec<Job> = state
            .ids(status.state())
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect();
        drop(state);

        for event in events {
            store.emit(event);
        }
        Ok(jobs)
    }

    async fn get_job_counts(&self) -> Result<JobCounts> {
        let state = self.store()?.lock()?;
        Ok(JobCounts {
            waiting: state.waiting.len(),
            active: state.active.len(),
            delayed: state.delayed.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
        })
    }

    async fn remove_repeatable(&self, name: &str, repeat: &RepeatOptions) -> Result<bool> {
        let store = self.store()?;
        let key = repeat::repeat_key(name, &repeat.pattern);
        let mut state = store.lock()?;
        if state.repeatables.remove(&key).is_none() {
            return Ok(false);
        }

        let pending: Vec<String> = state
            .delayed
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .get(*id)
                    .map(|j| j.repeat_key.as_deref() == Some(key.as_str()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for id in &pending {
            state.delayed.retain(|d| d != id);
            state.jobs.remove(id);
        }
        drop(state);

        for id in pending {
            store.emit(QueueEvent::Removed {
                queue: store.name.clone(),
                job_id: id,
            });
        }
        Ok(true)
    }

    async fn pause(&self) -> Result<()> {
        let store = self.store()?;
        store.lock()?.paused = true;
        store.emit(QueueEvent::Paused {
            queue: store.name.clone(),
        });
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        let store = self.store()?;
        store.lock()?.paused = false;
        store.emit(QueueEvent::Resumed {
            queue: store.name.clone(),
        });
        store.notify.notify_waiters();
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.store()?.lock()?.paused)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
