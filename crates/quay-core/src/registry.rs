//! Registry of named queues sharing one connection

use crate::config::{QueueConfig, QueuesConfig};
use crate::engine::Connection;
use crate::error::{CloseFailure, QueueError, Result};
use crate::queue::NamedQueue;
use crate::typed::TypedQueue;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Entry point aggregating every queue of an application
///
/// # Example
///
/// ```rust,ignore
/// let registry = QueueRegistry::new(config)?;
/// registry.initialize().await?;
///
/// let emails = registry.get_queue("emails")?;
/// emails.add(json!({ "to": "a@b.com" }), None).await?;
///
/// registry.close().await?;
/// ```
pub struct QueueRegistry {
    connection: Arc<dyn Connection>,
    prefix: String,
    queues: RwLock<HashMap<String, Arc<NamedQueue>>>,
    quit: AtomicBool,
}

impl std::fmt::Debug for QueueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRegistry")
            .field("backend", &self.connection.backend())
            .field("prefix", &self.prefix)
            .field("queues", &self.queue_names())
            .finish()
    }
}

impl QueueRegistry {
    /// Create the shared connection and register every configured queue
    pub fn new(config: QueuesConfig) -> Result<Self> {
        let connection = config.connection.connect()?;
        let registry = Self::with_connection(connection, config.prefix);
        for queue in config.queues {
            registry.add_queue(queue)?;
        }
        Ok(registry)
    }

    /// Registry over an existing connection
    pub fn with_connection(connection: Arc<dyn Connection>, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
            queues: RwLock::new(HashMap::new()),
            quit: AtomicBool::new(false),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Register a queue, replacing any queue already registered under its name
    pub fn add_queue(&self, config: QueueConfig) -> Result<Arc<NamedQueue>> {
        let queue = Arc::new(NamedQueue::new(
            config,
            self.connection.clone(),
            &self.prefix,
        )?);
        let mut queues = self
            .queues
            .write()
            .map_err(|_| QueueError::engine("Lock poisoned"))?;
        if queues
            .insert(queue.name().to_string(), queue.clone())
            .is_some()
        {
            tracing::warn!(queue = %queue.name(), "Replacing registered queue");
        }
        Ok(queue)
    }

    /// Look up a queue by name
    pub fn get_queue(&self, name: &str) -> Result<Arc<NamedQueue>> {
        self.queues
            .read()
            .map_err(|_| QueueError::engine("Lock poisoned"))?
            .get(name)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    /// Look up a queue with typed payloads and results
    pub fn typed<T, R>(&self, name: &str) -> Result<TypedQueue<T, R>>
    where
        T: Serialize + DeserializeOwned,
        R: DeserializeOwned,
    {
        self.get_queue(name).map(TypedQueue::new)
    }

    /// Registered names, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .read()
            .map(|queues| queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queues.read().map(|queues| queues.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Result<Vec<Arc<NamedQueue>>> {
        Ok(self
            .queues
            .read()
            .map_err(|_| QueueError::engine("Lock poisoned"))?
            .values()
            .cloned()
            .collect())
    }

    /// Initialize every queue concurrently.
    ///
    /// Queues that did initialize stay initialized when another one fails.
    pub async fn initialize(&self) -> Result<()> {
        let queues = self.snapshot()?;
        let results = join_all(queues.iter().map(|queue| queue.initialize())).await;

        let mut failed = 0;
        for (queue, result) in queues.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(queue = %queue.name(), error = %e, "Failed to initialize queue");
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(QueueError::Initialization(
                "Failed to initialize queues".to_string(),
            ));
        }
        tracing::info!(queues = queues.len(), "Queues initialized");
        Ok(())
    }

    /// Close every queue concurrently, then quit the shared connection.
    ///
    /// All queues are closed even when some fail; failures are returned
    /// together. The connection is released once across repeated calls.
    pub async fn close(&self) -> Result<()> {
        let queues = self.snapshot()?;
        let results = join_all(queues.iter().map(|queue| queue.close())).await;

        let mut failures: Vec<CloseFailure> = queues
            .iter()
            .zip(results)
            .filter_map(|(queue, result)| {
                result.err().map(|error| CloseFailure {
                    resource: queue.name().to_string(),
                    error,
                })
            })
            .collect();

        if !self.quit.swap(true, Ordering::SeqCst) {
            if let Err(error) = self.connection.quit().await {
                failures.push(CloseFailure {
                    resource: "connection".to_string(),
                    error,
                });
            }
        }

        if failures.is_empty() {
            tracing::info!(queues = queues.len(), "Queues closed");
            return Ok(());
        }
        for failure in &failures {
            tracing::warn!(resource = %failure.resource, error = %failure.error, "Failed to close");
        }
        Err(QueueError::CloseFailed { failures })
    }
}
