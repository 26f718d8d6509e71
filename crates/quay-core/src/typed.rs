//! Statically typed view of a named queue

use crate::error::{QueueError, Result};
use crate::job::{Job, JobOptions, JobStatus};
use crate::queue::NamedQueue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// A job whose payload and return value were validated into `T` and `R`
#[derive(Debug, Clone)]
pub struct TypedJob<T, R> {
    pub id: String,
    pub name: String,
    pub data: T,
    pub return_value: Option<R>,
    pub job: Job,
}

impl<T, R> TypedJob<T, R>
where
    T: DeserializeOwned,
    R: DeserializeOwned,
{
    pub fn from_job(job: Job) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            name: job.name.clone(),
            data: job.data_as()?,
            return_value: job.return_value_as()?,
            job,
        })
    }
}

/// Queue handle with payload type `T` and result type `R`.
///
/// Payloads are serialized on the way in and validated on the way out, so a
/// job stored with a different shape surfaces as [`QueueError::InvalidPayload`].
pub struct TypedQueue<T, R = serde_json::Value> {
    inner: Arc<NamedQueue>,
    _marker: PhantomData<fn(T) -> R>,
}

impl<T, R> Clone for TypedQueue<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T, R> TypedQueue<T, R>
where
    T: Serialize + DeserializeOwned,
    R: DeserializeOwned,
{
    pub fn new(inner: Arc<NamedQueue>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The untyped queue
    pub fn inner(&self) -> &Arc<NamedQueue> {
        &self.inner
    }

    fn encode(data: &T) -> Result<serde_json::Value> {
        serde_json::to_value(data).map_err(|e| QueueError::InvalidPayload(e.to_string()))
    }

    pub async fn add(&self, data: &T, opts: Option<JobOptions>) -> Result<TypedJob<T, R>> {
        let job = self.inner.add(Self::encode(data)?, opts).await?;
        TypedJob::from_job(job)
    }

    pub async fn add_cron(
        &self,
        job_name: impl Into<String>,
        data: &T,
        cron: &str,
        opts: Option<JobOptions>,
    ) -> Result<TypedJob<T, R>> {
        let job = self
            .inner
            .add_cron(job_name, Self::encode(data)?, cron, opts)
            .await?;
        TypedJob::from_job(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<TypedJob<T, R>>> {
        self.inner
            .get_job(id)
            .await?
            .map(TypedJob::from_job)
            .transpose()
    }

    pub async fn get_jobs<S>(&self, status: S) -> Result<Vec<TypedJob<T, R>>>
    where
        S: TryInto<JobStatus>,
        QueueError: From<S::Error>,
    {
        self.inner
            .get_jobs(status)
            .await?
            .into_iter()
            .map(TypedJob::from_job)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
    }

    fn job(data: serde_json::Value) -> Job {
        Job::new("1".into(), "emails".into(), data, JobOptions::default())
    }

    #[test]
    fn typed_job_validates_payload() {
        let typed: TypedJob<Email, serde_json::Value> =
            TypedJob::from_job(job(json!({ "to": "a@b.com" }))).unwrap();
        assert_eq!(typed.data, Email { to: "a@b.com".into() });
        assert!(typed.return_value.is_none());
    }

    #[test]
    fn mismatched_payload_is_rejected() {
        let result = TypedJob::<Email, serde_json::Value>::from_job(job(json!({ "subject": 1 })));
        assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
    }
}
