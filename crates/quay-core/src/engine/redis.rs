//! Redis-backed queue engine
//!
//! Keys for a queue `{prefix}:{name}`:
//! - `{key}:id` - job id counter
//! - `{key}:job:{id}` - job record (JSON)
//! - `{key}:wait` / `{key}:active` - lists of job ids
//! - `{key}:delayed` - sorted set of job ids (score = run time in ms)
//! - `{key}:completed` / `{key}:failed` - lists of finished job ids
//! - `{key}:repeat` - hash of repeatable definitions
//! - `{key}:paused` - present while the queue is paused
//! - `{key}:events` - pub/sub channel carrying `QueueEvent` JSON
//!
//! The waiting list is FIFO; jobs with a non-zero priority are pushed to its head.

use super::{
    Connection, ErrorObserver, EventRelay, EventStream, JobSource, NewJob, QueueBackend,
    QueueSpec, SlotWorker, WorkerBackend,
};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobCounts, JobOptions, JobState, JobStatus, QueueEvent, RepeatOptions};
use crate::processor::Processor;
use crate::repeat;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Engine(err.to_string())
    }
}

/// Moves due delayed jobs to the waiting list and returns their ids
const PROMOTE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
end
return ids
"#;

struct Shared {
    client: Client,
    manager: OnceCell<ConnectionManager>,
    quit: AtomicBool,
}

impl Shared {
    async fn conn(&self) -> Result<ConnectionManager> {
        if self.quit.load(Ordering::SeqCst) {
            return Err(QueueError::engine("connection is closed"));
        }
        let manager = self
            .manager
            .get_or_try_init(|| async {
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(QueueError::from)
            })
            .await?;
        Ok(manager.clone())
    }
}

/// Shared Redis connection
///
/// Opening does not connect; the multiplexed connection is established on
/// first use and reconnects on its own afterwards.
#[derive(Clone)]
pub struct RedisConnection {
    shared: Arc<Shared>,
}

impl RedisConnection {
    pub fn open(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| QueueError::Config(e.to_string()))?;
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                manager: OnceCell::new(),
                quit: AtomicBool::new(false),
            }),
        })
    }

    fn store(&self, spec: &QueueSpec) -> RedisStore {
        RedisStore {
            name: spec.name.clone(),
            key: spec.key(),
            shared: self.shared.clone(),
            promote: Script::new(PROMOTE_SCRIPT),
        }
    }
}

#[async_trait]
impl Connection for RedisConnection {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn queue(&self, spec: &QueueSpec) -> Result<Arc<dyn QueueBackend>> {
        Ok(Arc::new(RedisQueue {
            store: self.store(spec),
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
        let store = Arc::new(self.store(spec));
        // fail early when the store is unreachable
        store.shared.conn().await?;
        Ok(Box::new(SlotWorker::spawn(
            store,
            processor,
            concurrency,
            on_error,
        )))
    }

    async fn events(&self, spec: &QueueSpec) -> Result<Box<dyn EventStream>> {
        let channel = format!("{}:events", spec.key());
        let mut pubsub = self
            .shared
            .client
            .get_async_connection()
            .await?
            .into_pubsub();
        pubsub.subscribe(&channel).await?;

        let queue = spec.name.clone();
        let events = pubsub.into_on_message().filter_map(move |msg| {
            let queue = queue.clone();
            async move {
                let payload: String = msg.get_payload().ok()?;
                match serde_json::from_str::<QueueEvent>(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "Ignoring malformed event");
                        None
                    }
                }
            }
        });
        Ok(Box::new(EventRelay::spawn(events)))
    }

    async fn quit(&self) -> Result<()> {
        if let Some(manager) = self.shared.manager.get() {
            let mut conn = manager.clone();
            redis::cmd("QUIT").query_async::<_, ()>(&mut conn).await?;
        }
        self.shared.quit.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RepeatDefinition {
    name: String,
    data: serde_json::Value,
    opts: JobOptions,
    materialized: u32,
}

/// Key-level operations shared by queue and worker handles
struct RedisStore {
    name: String,
    key: String,
    shared: Arc<Shared>,
    promote: Script,
}

impl RedisStore {
    fn k(&self, suffix: &str) -> String {
        format!("{}:{}", self.key, suffix)
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.key, id)
    }

    fn list_key(&self, state: JobState) -> String {
        match state {
            JobState::Waiting => self.k("wait"),
            JobState::Active => self.k("active"),
            JobState::Delayed => self.k("delayed"),
            JobState::Completed => self.k("completed"),
            JobState::Failed => self.k("failed"),
        }
    }

    async fn publish(&self, conn: &mut ConnectionManager, event: &QueueEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        redis::cmd("PUBLISH")
            .arg(self.k("events"))
            .arg(payload)
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    async fn load(&self, conn: &mut ConnectionManager, id: &str) -> Result<Option<Job>> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.job_key(id))
            .query_async(conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, conn: &mut ConnectionManager, job: &Job) -> Result<()> {
        redis::cmd("SET")
            .arg(self.job_key(&job.id))
            .arg(serde_json::to_string(job)?)
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    /// Store a new job record unless the id is taken; returns the stored record
    async fn insert(&self, conn: &mut ConnectionManager, job: &Job) -> Result<Option<Job>> {
        let created: Option<String> = redis::cmd("SET")
            .arg(self.job_key(&job.id))
            .arg(serde_json::to_string(job)?)
            .arg("NX")
            .query_async(conn)
            .await?;
        if created.is_some() {
            Ok(None)
        } else {
            self.load(conn, &job.id).await
        }
    }

    async fn schedule(&self, conn: &mut ConnectionManager, job: &Job) -> Result<()> {
        match (job.state, job.run_at) {
            (JobState::Delayed, Some(run_at)) => {
                redis::cmd("ZADD")
                    .arg(self.k("delayed"))
                    .arg(run_at.timestamp_millis())
                    .arg(&job.id)
                    .query_async::<_, ()>(conn)
                    .await?;
                self.publish(
                    conn,
                    &QueueEvent::Delayed {
                        queue: self.name.clone(),
                        job_id: job.id.clone(),
                        run_at,
                    },
                )
                .await
            }
            _ => {
                let push = if job.opts.priority > 0 { "LPUSH" } else { "RPUSH" };
                redis::cmd(push)
                    .arg(self.k("wait"))
                    .arg(&job.id)
                    .query_async::<_, ()>(conn)
                    .await?;
                self.publish(
                    conn,
                    &QueueEvent::Waiting {
                        queue: self.name.clone(),
                        job_id: job.id.clone(),
                    },
                )
                .await
            }
        }
    }

    async fn add(&self, new_job: NewJob) -> Result<Job> {
        if let Some(repeat) = new_job.opts.repeat.clone() {
            return self.add_repeatable(new_job, repeat).await;
        }
        new_job.opts.validate()?;
        let run_at = new_job.opts.delayed_until(Utc::now())?;

        let mut conn = self.shared.conn().await?;
        let id = match &new_job.opts.job_id {
            Some(id) => id.clone(),
            None => {
                let next: u64 = redis::cmd("INCR")
                    .arg(self.k("id"))
                    .query_async(&mut conn)
                    .await?;
                next.to_string()
            }
        };

        let mut job = Job::new(id, new_job.name, new_job.data, new_job.opts);
        if let Some(run_at) = run_at {
            job.state = JobState::Delayed;
            job.run_at = Some(run_at);
        }

        if let Some(existing) = self.insert(&mut conn, &job).await? {
            return Ok(existing);
        }
        self.publish(
            &mut conn,
            &QueueEvent::Added {
                queue: self.name.clone(),
                job_id: job.id.clone(),
                name: job.name.clone(),
            },
        )
        .await?;
        self.schedule(&mut conn, &job).await?;
        Ok(job)
    }

    async fn add_repeatable(&self, new_job: NewJob, repeat: RepeatOptions) -> Result<Job> {
        new_job.opts.validate()?;
        let key = repeat::repeat_key(&new_job.name, &repeat.pattern);
        let run_at = repeat::next_run(&repeat.pattern, Utc::now())?.ok_or_else(|| {
            QueueError::InvalidCron {
                pattern: repeat.pattern.clone(),
                reason: "schedule has no upcoming run".to_string(),
            }
        })?;

        let mut conn = self.shared.conn().await?;
        let existing = self.definition(&mut conn, &key).await?;
        let definition = RepeatDefinition {
            name: new_job.name,
            data: new_job.data,
            opts: new_job.opts,
            materialized: existing.map(|d| d.materialized).unwrap_or(0),
        };
        self.store_definition(&mut conn, &key, &definition).await?;

        if let Some(pending) = self.pending_repeat(&mut conn, &key).await? {
            return Ok(pending);
        }
        self.materialize(&mut conn, &key, run_at)
            .await?
            .ok_or_else(|| QueueError::engine(format!("repeat limit reached for {}", key)))
    }

    async fn definition(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
    ) -> Result<Option<RepeatDefinition>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.k("repeat"))
            .arg(key)
            .query_async(conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store_definition(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        definition: &RepeatDefinition,
    ) -> Result<()> {
        redis::cmd("HSET")
            .arg(self.k("repeat"))
            .arg(key)
            .arg(serde_json::to_string(definition)?)
            .query_async::<_, ()>(conn)
            .await?;
        Ok(())
    }

    /// Delayed ids materialized by the repeatable definition `key`
    async fn repeat_ids(&self, conn: &mut ConnectionManager, key: &str) -> Result<Vec<String>> {
        let prefix = format!("repeat:{}:", key);
        let delayed: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.k("delayed"))
            .arg(0)
            .arg(-1)
            .query_async(conn)
            .await?;
        Ok(delayed.into_iter().filter(|id| id.starts_with(&prefix)).collect())
    }

    async fn pending_repeat(&self, conn: &mut ConnectionManager, key: &str) -> Result<Option<Job>> {
        match self.repeat_ids(conn, key).await?.first() {
            Some(id) => self.load(conn, id).await,
            None => Ok(None),
        }
    }

    async fn materialize(
        &self,
        conn: &mut ConnectionManager,
        key: &str,
        run_at: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let Some(mut definition) = self.definition(conn, key).await? else {
            return Ok(None);
        };
        if let Some(limit) = definition.opts.repeat.as_ref().and_then(|r| r.limit) {
            if definition.materialized >= limit {
                return Ok(None);
            }
        }
        definition.materialized += 1;
        self.store_definition(conn, key, &definition).await?;

        let mut job = Job::new(
            repeat::repeat_job_id(key, run_at),
            definition.name,
            definition.data,
            definition.opts,
        );
        job.state = JobState::Delayed;
        job.run_at = Some(run_at);
        job.repeat_key = Some(key.to_string());

        if let Some(existing) = self.insert(conn, &job).await? {
            return Ok(Some(existing));
        }
        self.schedule(conn, &job).await?;
        Ok(Some(job))
    }

    async fn promote_due(&self, conn: &mut ConnectionManager) -> Result<()> {
        let now = Utc::now();
        let promoted: Vec<String> = self
            .promote
            .key(self.k("delayed"))
            .key(self.k("wait"))
            .arg(now.timestamp_millis())
            .invoke_async(conn)
            .await?;

        for id in promoted {
            let Some(mut job) = self.load(conn, &id).await? else {
                continue;
            };
            let run_at = job.run_at.unwrap_or(now);
            job.state = JobState::Waiting;
            self.save(conn, &job).await?;
            self.publish(
                conn,
                &QueueEvent::Waiting {
                    queue: self.name.clone(),
                    job_id: id,
                },
            )
            .await?;

            if let (Some(key), Some(repeat)) = (&job.repeat_key, &job.opts.repeat) {
                if let Some(next) = repeat::next_run(&repeat.pattern, run_at.max(now))? {
                    self.materialize(conn, key, next).await?;
                }
            }
        }
        Ok(())
    }

    async fn is_paused(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let paused: bool = redis::cmd("EXISTS")
            .arg(self.k("paused"))
            .query_async(conn)
            .await?;
        Ok(paused)
    }
}

#[async_trait]
impl JobSource for RedisStore {
    fn queue_name(&self) -> &str {
        &self.name
    }

    async fn fetch_next(&self) -> Result<Option<Job>> {
        let mut conn = self.shared.conn().await?;
        self.promote_due(&mut conn).await?;
        if self.is_paused(&mut conn).await? {
            return Ok(None);
        }

        let id: Option<String> = redis::cmd("LMOVE")
            .arg(self.k("wait"))
            .arg(self.k("active"))
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(&mut conn)
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };
        let Some(mut job) = self.load(&mut conn, &id).await? else {
            // record vanished; drop the dangling id
            redis::cmd("LREM")
                .arg(self.k("active"))
                .arg(1)
                .arg(&id)
                .query_async::<_, ()>(&mut conn)
                .await?;
            return Ok(None);
        };

        job.state = JobState::Active;
        job.processed_on = Some(Utc::now());
        job.attempts_made += 1;
        self.save(&mut conn, &job).await?;
        self.publish(
            &mut conn,
            &QueueEvent::Active {
                queue: self.name.clone(),
                job_id: id,
            },
        )
        .await?;
        Ok(Some(job))
    }

    async fn complete(&self, id: &str, value: serde_json::Value) -> Result<()> {
        let mut conn = self.shared.conn().await?;
        redis::cmd("LREM")
            .arg(self.k("active"))
            .arg(1)
            .arg(id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Ok(());
        };

        if job.opts.remove_on_complete {
            redis::cmd("DEL")
                .arg(self.job_key(id))
                .query_async::<_, ()>(&mut conn)
                .await?;
        } else {
            job.state = JobState::Completed;
            job.finished_on = Some(Utc::now());
            job.return_value = Some(value.clone());
            self.save(&mut conn, &job).await?;
            redis::cmd("RPUSH")
                .arg(self.k("completed"))
                .arg(id)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        self.publish(
            &mut conn,
            &QueueEvent::Completed {
                queue: self.name.clone(),
                job_id: id.to_string(),
                return_value: value,
            },
        )
        .await
    }

    async fn fail(&self, id: &str, reason: String) -> Result<()> {
        let mut conn = self.shared.conn().await?;
        redis::cmd("LREM")
            .arg(self.k("active"))
            .arg(1)
            .arg(id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        let Some(mut job) = self.load(&mut conn, id).await? else {
            return Ok(());
        };
        job.failed_reason = Some(reason.clone());

        if job.can_retry() {
            match job.opts.retry_at(Utc::now()) {
                Some(run_at) => {
                    job.state = JobState::Delayed;
                    job.run_at = Some(run_at);
                }
                None => job.state = JobState::Waiting,
            }
            self.save(&mut conn, &job).await?;
            return self.schedule(&mut conn, &job).await;
        }

        if job.opts.remove_on_fail {
            redis::cmd("DEL")
                .arg(self.job_key(id))
                .query_async::<_, ()>(&mut conn)
                .await?;
        } else {
            job.state = JobState::Failed;
            job.finished_on = Some(Utc::now());
            self.save(&mut conn, &job).await?;
            redis::cmd("RPUSH")
                .arg(self.k("failed"))
                .arg(id)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }

        self.publish(
            &mut conn,
            &QueueEvent::Failed {
                queue: self.name.clone(),
                job_id: id.to_string(),
                reason,
            },
        )
        .await
    }
}

/// Queue handle of the Redis engine
pub struct RedisQueue {
    store: RedisStore,
    closed: AtomicBool,
}

impl RedisQueue {
    async fn conn(&self) -> Result<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed(self.store.name.clone()));
        }
        self.store.shared.conn().await
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn add(&self, job: NewJob) -> Result<Job> {
        self.conn().await?;
        self.store.add(job).await
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let mut conn = self.conn().await?;
        self.store.load(&mut conn, id).await
    }

    async fn get_jobs(&self, status: JobStatus) -> Result<Vec<Job>> {
        let mut conn = self.conn().await?;
        let key = self.store.list_key(status.state());
        let mut range = match status {
            JobStatus::Delayed => redis::cmd("ZRANGE"),
            _ => redis::cmd("LRANGE"),
        };
        let ids: Vec<String> = range
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.store.job_key(id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        raw.into_iter()
            .flatten()
            .map(|raw| serde_json::from_str(&raw).map_err(QueueError::from))
            .collect()
    }

    async fn get_job_counts(&self) -> Result<JobCounts> {
        let mut conn = self.conn().await?;
        let (waiting, active, delayed, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.store.k("wait"))
                .cmd("LLEN")
                .arg(self.store.k("active"))
                .cmd("ZCARD")
                .arg(self.store.k("delayed"))
                .cmd("LLEN")
                .arg(self.store.k("completed"))
                .cmd("LLEN")
                .arg(self.store.k("failed"))
                .query_async(&mut conn)
                .await?;
        Ok(JobCounts {
            waiting,
            active,
            delayed,
            completed,
            failed,
        })
    }

    async fn remove_repeatable(&self, name: &str, repeat: &RepeatOptions) -> Result<bool> {
        let mut conn = self.conn().await?;
        let key = repeat::repeat_key(name, &repeat.pattern);
        let removed: u32 = redis::cmd("HDEL")
            .arg(self.store.k("repeat"))
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            return Ok(false);
        }

        for id in self.store.repeat_ids(&mut conn, &key).await? {
            redis::pipe()
                .cmd("ZREM")
                .arg(self.store.k("delayed"))
                .arg(&id)
                .ignore()
                .cmd("DEL")
                .arg(self.store.job_key(&id))
                .ignore()
                .query_async::<_, ()>(&mut conn)
                .await?;
            self.store
                .publish(
                    &mut conn,
                    &QueueEvent::Removed {
                        queue: self.store.name.clone(),
                        job_id: id,
                    },
                )
                .await?;
        }
        Ok(true)
    }

    async fn pause(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(self.store.k("paused"))
            .arg(Utc::now().timestamp_millis())
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.store
            .publish(
                &mut conn,
                &QueueEvent::Paused {
                    queue: self.store.name.clone(),
                },
            )
            .await
    }

    async fn resume(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(self.store.k("paused"))
            .query_async::<_, ()>(&mut conn)
            .await?;
        self.store
            .publish(
                &mut conn,
                &QueueEvent::Resumed {
                    queue: self.store.name.clone(),
                },
            )
            .await
    }

    async fn is_paused(&self) -> Result<bool> {
        let mut conn = self.conn().await?;
        self.store.is_paused(&mut conn).await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOptions;

    fn store() -> RedisStore {
        let connection = RedisConnection::open("redis://127.0.0.1:6379/0").unwrap();
        connection.store(&QueueSpec::new("emails", "quay", QueueOptions::new()))
    }

    #[test]
    fn keys_are_namespaced_by_prefix_and_queue() {
        let store = store();
        assert_eq!(store.k("id"), "quay:emails:id");
        assert_eq!(store.k("events"), "quay:emails:events");
        assert_eq!(store.job_key("42"), "quay:emails:job:42");
    }

    #[test]
    fn every_state_has_its_own_key() {
        let store = store();
        assert_eq!(store.list_key(JobState::Waiting), "quay:emails:wait");
        assert_eq!(store.list_key(JobState::Active), "quay:emails:active");
        assert_eq!(store.list_key(JobState::Delayed), "quay:emails:delayed");
        assert_eq!(store.list_key(JobState::Completed), "quay:emails:completed");
        assert_eq!(store.list_key(JobState::Failed), "quay:emails:failed");
    }

    #[test]
    fn queue_prefix_option_overrides_registry_prefix() {
        let connection = RedisConnection::open("redis://127.0.0.1:6379/0").unwrap();
        let store = connection.store(&QueueSpec::new(
            "emails",
            "quay",
            QueueOptions::new().prefix("tenant-a"),
        ));
        assert_eq!(store.list_key(JobState::Waiting), "tenant-a:emails:wait");
    }

    #[test]
    fn repeat_ids_share_the_definition_prefix() {
        let key = repeat::repeat_key("daily-report", "0 0 * * *");
        let id = repeat::repeat_job_id(&key, Utc::now());
        assert!(id.starts_with(&format!("repeat:{}:", key)));
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let err = RedisConnection::open("not a url").err().unwrap();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[tokio::test]
    async fn quit_without_use_does_not_connect() {
        let connection = RedisConnection::open("redis://127.0.0.1:1/0").unwrap();
        let queue = connection
            .queue(&QueueSpec::new("emails", "quay", QueueOptions::new()))
            .unwrap();

        connection.quit().await.unwrap();

        let err = queue
            .add(NewJob {
                name: "emails".into(),
                data: serde_json::json!({}),
                opts: JobOptions::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Engine(ref msg) if msg == "connection is closed"));
    }

    #[tokio::test]
    async fn closed_queue_handle_rejects_calls() {
        let connection = RedisConnection::open("redis://127.0.0.1:1/0").unwrap();
        let queue = connection
            .queue(&QueueSpec::new("emails", "quay", QueueOptions::new()))
            .unwrap();
        queue.close().await.unwrap();
        assert!(matches!(
            queue.get_job_counts().await,
            Err(QueueError::Closed(ref name)) if name == "emails"
        ));
    }
}
