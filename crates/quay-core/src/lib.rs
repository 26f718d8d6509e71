//! # quay-core
//!
//! Named job queues over a shared store connection.
//!
//! A [`QueueRegistry`] is built from a [`QueuesConfig`]: it opens one
//! connection, creates a [`NamedQueue`] per configured queue, starts workers
//! for queues that have a processor on [`QueueRegistry::initialize`], and
//! releases everything on [`QueueRegistry::close`].
//!
//! ## Engines
//!
//! - memory (default): in-process, for development and tests
//! - redis (feature `redis`): jobs stored in Redis, shared across processes
//!
//! ## Example
//!
//! ```rust,ignore
//! use quay_core::{processor_fn, QueueConfig, QueueRegistry, QueuesConfig};
//! use serde_json::json;
//!
//! let registry = QueueRegistry::new(
//!     QueuesConfig::new().queue(
//!         QueueConfig::new("emails")
//!             .processor(processor_fn(|job| async move { Ok(job.data) }))
//!             .concurrency(3),
//!     ),
//! )?;
//! registry.initialize().await?;
//!
//! let job = registry
//!     .get_queue("emails")?
//!     .add(json!({ "to": "a@b.com" }), None)
//!     .await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod repeat;
pub mod typed;

pub use config::{Backend, ConnectionOptions, QueueConfig, QueueOptions, QueuesConfig};
pub use engine::memory::MemoryConnection;
pub use engine::Connection;
pub use error::{CloseFailure, QueueError, Result};
pub use job::{
    BulkJob, Job, JobCounts, JobOptions, JobState, JobStatus, QueueEvent, RepeatOptions,
};
pub use processor::{
    processor_fn, typed_processor, BoxError, JobHandler, Processor, SandboxedProcessor,
};
pub use queue::{NamedQueue, QueueState};
pub use registry::QueueRegistry;
pub use typed::{TypedJob, TypedQueue};

#[cfg(feature = "redis")]
pub use engine::redis::RedisConnection;
