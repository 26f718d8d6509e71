//! # quay-http
//!
//! Runs quay queues alongside a tower/hyper HTTP service.
//!
//! - [`QueuePlugin`] ties queue initialization and shutdown to the
//!   application's start and stop
//! - [`QueuesLayer`] makes the registry available to handlers as [`Queues`]
//! - [`HttpError`] turns queue errors into JSON responses (unknown queue: 404)
//! - [`serve`] runs an HTTP/1 server between start and stop

mod error;
mod layer;
mod plugin;
mod server;

pub use error::{HttpError, ServeError};
pub use layer::{Queues, QueuesLayer, QueuesService};
pub use plugin::QueuePlugin;
pub use server::serve;

pub use quay_core;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info,quay=debug`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quay=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
