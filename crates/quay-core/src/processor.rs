//! Job processors
//!
//! A processor is the user-supplied code a worker runs for every job. It is
//! either an in-process handler (`JobHandler`) or an external program
//! referenced by path (`SandboxedProcessor`).

use crate::job::Job;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Error type returned by processors
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handles one job and produces its return value
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn process(&self, job: Job) -> Result<serde_json::Value, BoxError>;
}

/// A shareable processor
pub type Processor = Arc<dyn JobHandler>;

/// Processor backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
{
    async fn process(&self, job: Job) -> Result<serde_json::Value, BoxError> {
        (self.f)(job).await
    }
}

/// Build a processor from an async closure over the raw job
///
/// # Example
///
/// ```rust,ignore
/// let processor = processor_fn(|job| async move {
///     Ok(serde_json::json!({ "sent": true, "to": job.data["to"] }))
/// });
/// ```
pub fn processor_fn<F, Fut>(f: F) -> Processor
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, BoxError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Processor that deserializes the payload into `T` and serializes the result `R`
pub struct TypedHandler<T, R, F> {
    f: F,
    _marker: PhantomData<fn(T) -> R>,
}

#[async_trait]
impl<T, R, F, Fut> JobHandler for TypedHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Job, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    async fn process(&self, job: Job) -> Result<serde_json::Value, BoxError> {
        let data: T = job.data_as()?;
        let result = (self.f)(job, data).await?;
        Ok(serde_json::to_value(result)?)
    }
}

/// Build a processor whose payload is validated into `T` before the closure runs
pub fn typed_processor<T, R, F, Fut>(f: F) -> Processor
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Job, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, BoxError>> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _marker: PhantomData,
    })
}

/// Runs an external program once per job.
///
/// The job is written to the program's stdin as JSON. Stdout is parsed as the
/// JSON return value; output that is not JSON is returned as a string. A
/// non-zero exit status fails the job with the program's stderr.
#[derive(Debug, Clone)]
pub struct SandboxedProcessor {
    program: PathBuf,
    args: Vec<String>,
}

impl SandboxedProcessor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl JobHandler for SandboxedProcessor {
    async fn process(&self, job: Job) -> Result<serde_json::Value, BoxError> {
        let input = serde_json::to_vec(&job)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("QUAY_JOB_ID", &job.id)
            .env("QUAY_JOB_NAME", &job.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", self.program.display(), e))?;

        // feed stdin while draining stdout so a chatty child cannot block on a full pipe
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if let Err(e) = fed {
            // the child may exit before reading all of its input
            tracing::debug!(
                program = %self.program.display(),
                error = %e,
                "Failed to write job to stdin"
            );
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(stdout)
            .unwrap_or_else(|_| serde_json::Value::String(stdout.to_string())))
    }
}
