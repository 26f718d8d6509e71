//! HTTP/1 server running a service between the plugin's start and stop

use crate::error::ServeError;
use crate::plugin::QueuePlugin;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::convert::Infallible;
use std::future::Future;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_service::Service;
use tracing::{error, info, warn};

/// Serve `service` on `listener` until `shutdown` resolves.
///
/// Queues are initialized before the first connection is accepted and closed
/// after the accept loop stops, or when startup fails. The service is wrapped
/// in the plugin's layer.
pub async fn serve<S, F>(
    listener: TcpListener,
    plugin: QueuePlugin,
    service: S,
    shutdown: F,
) -> Result<(), ServeError>
where
    S: Service<Request<Incoming>, Response = Response<Full<Bytes>>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    F: Future<Output = ()> + Send,
{
    if let Err(err) = plugin.on_start().await {
        stop_after_failure(&plugin).await;
        return Err(err.into());
    }

    let service = ServiceBuilder::new().layer(plugin.layer()).service(service);
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            stop_after_failure(&plugin).await;
            return Err(err.into());
        }
    };
    info!(addr = %addr, "Server listening");

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!("Accept error: {}", err);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = TowerToHyperService::new(service.clone());

                tokio::spawn(async move {
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!(remote_addr = %remote_addr, "Connection error: {}", err);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    plugin.on_stop().await?;
    Ok(())
}

/// Release queues that did start before the server gave up
async fn stop_after_failure(plugin: &QueuePlugin) {
    if let Err(err) = plugin.on_stop().await {
        warn!(error = %err, "Failed to stop queues after startup failure");
    }
}
