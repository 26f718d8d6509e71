//! Request-scoped access to the queue registry

use crate::error::HttpError;
use http::{Extensions, Request};
use quay_core::{NamedQueue, QueueRegistry};
use std::ops::Deref;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Layer;
use tower_service::Service;

/// The queue registry as seen from a request handler
#[derive(Clone)]
pub struct Queues(pub Arc<QueueRegistry>);

impl Queues {
    /// Registry attached by [`QueuesLayer`]; a 500 when the layer is missing
    pub fn from_extensions(extensions: &Extensions) -> Result<Self, HttpError> {
        extensions.get::<Queues>().cloned().ok_or_else(|| {
            HttpError::internal("Queues not available. Did you forget to add QueuesLayer?")
        })
    }

    pub fn from_request<B>(req: &Request<B>) -> Result<Self, HttpError> {
        Self::from_extensions(req.extensions())
    }

    /// Look up a queue, answering 404 for unknown names
    pub fn queue(&self, name: &str) -> Result<Arc<NamedQueue>, HttpError> {
        self.0.get_queue(name).map_err(HttpError::from)
    }
}

impl Deref for Queues {
    type Target = QueueRegistry;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Layer inserting [`Queues`] into every request's extensions
#[derive(Clone)]
pub struct QueuesLayer {
    queues: Queues,
}

impl QueuesLayer {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            queues: Queues(registry),
        }
    }
}

impl<S> Layer<S> for QueuesLayer {
    type Service = QueuesService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        QueuesService {
            inner,
            queues: self.queues.clone(),
        }
    }
}

/// Service produced by [`QueuesLayer`]
#[derive(Clone)]
pub struct QueuesService<S> {
    inner: S,
    queues: Queues,
}

impl<S, B> Service<Request<B>> for QueuesService<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.queues.clone());
        self.inner.call(req)
    }
}
