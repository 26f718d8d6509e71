//! Binding of the queue registry to an application's start and stop

use crate::layer::{Queues, QueuesLayer};
use quay_core::{QueueError, QueueRegistry, QueuesConfig};
use std::sync::Arc;

/// Queue plugin for a tower/hyper application
///
/// `on_start` initializes every queue, `on_stop` closes them and the shared
/// connection, and [`QueuePlugin::layer`] makes the registry reachable from
/// handlers as [`Queues`].
///
/// # Example
///
/// ```rust,ignore
/// let plugin = QueuePlugin::new(config)?;
/// let service = ServiceBuilder::new()
///     .layer(plugin.layer())
///     .service(service_fn(handle));
///
/// quay_http::serve(listener, plugin, service, shutdown_signal()).await?;
/// ```
#[derive(Clone)]
pub struct QueuePlugin {
    registry: Arc<QueueRegistry>,
}

impl QueuePlugin {
    /// Name under which the plugin registers itself
    pub const NAME: &'static str = "quay";

    pub fn new(config: QueuesConfig) -> Result<Self, QueueError> {
        Ok(Self::from_registry(Arc::new(QueueRegistry::new(config)?)))
    }

    pub fn from_registry(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    pub fn queues(&self) -> Queues {
        Queues(self.registry.clone())
    }

    pub fn layer(&self) -> QueuesLayer {
        QueuesLayer::new(self.registry.clone())
    }

    /// Application start: initialize every queue
    pub async fn on_start(&self) -> Result<(), QueueError> {
        tracing::info!(
            plugin = Self::NAME,
            queues = ?self.registry.queue_names(),
            "Starting queues"
        );
        self.registry.initialize().await
    }

    /// Application stop: close every queue, then the connection
    pub async fn on_stop(&self) -> Result<(), QueueError> {
        tracing::info!(plugin = Self::NAME, "Stopping queues");
        self.registry.close().await
    }
}
