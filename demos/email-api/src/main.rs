//! Email and report queues behind a small JSON API.
//!
//! Run with `cargo run -p email-api` (memory engine) or, against Redis,
//! `QUAY_BACKEND=redis cargo run -p email-api --features redis`.
//!
//! Routes:
//! - `POST /send-email` enqueue an email
//! - `GET  /email-jobs/:status` list email jobs by state
//! - `POST /schedule-report` enqueue a report
//! - `POST /schedule-recurring-report` register a cron report
//! - `GET  /report-jobs/:status` list report jobs by state
//! - `GET  /job/:queue/:id` look up one job
//! - `GET  /queues/:queue/counts` job counts per state
//! - `POST /queues/:queue/pause` and `/queues/:queue/resume`

use bytes::Bytes;
use chrono::Utc;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use quay_core::{
    typed_processor, BoxError, ConnectionOptions, Job, QueueConfig, QueuesConfig,
};
use quay_http::{HttpError, QueuePlugin, Queues};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::service_fn;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
    body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportJob {
    user_id: String,
    report_type: String,
    #[serde(default)]
    parameters: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecurringReport {
    cron_pattern: String,
    #[serde(flatten)]
    report: ReportJob,
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Index,
    SendEmail,
    EmailJobs,
    ScheduleReport,
    ScheduleRecurringReport,
    ReportJobs,
    Job,
    Counts,
    Pause,
    Resume,
}

fn routes() -> Result<matchit::Router<Route>, matchit::InsertError> {
    let mut router = matchit::Router::new();
    router.insert("/", Route::Index)?;
    router.insert("/send-email", Route::SendEmail)?;
    router.insert("/email-jobs/:status", Route::EmailJobs)?;
    router.insert("/schedule-report", Route::ScheduleReport)?;
    router.insert("/schedule-recurring-report", Route::ScheduleRecurringReport)?;
    router.insert("/report-jobs/:status", Route::ReportJobs)?;
    router.insert("/job/:queue/:id", Route::Job)?;
    router.insert("/queues/:queue/counts", Route::Counts)?;
    router.insert("/queues/:queue/pause", Route::Pause)?;
    router.insert("/queues/:queue/resume", Route::Resume)?;
    Ok(router)
}

fn config(connection: ConnectionOptions) -> QueuesConfig {
    let emails = QueueConfig::new("emails")
        .processor(typed_processor(|_job, email: EmailJob| async move {
            tracing::info!(to = %email.to, subject = %email.subject, "Sending email");
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, BoxError>(json!({ "sent": true, "timestamp": Utc::now() }))
        }))
        .concurrency(5);

    let reports = QueueConfig::new("reports")
        .processor_path(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/processors/report-processor.sh"
        ))
        .concurrency(2);

    QueuesConfig::new()
        .connection(connection)
        .queue(emails)
        .queue(reports)
}

fn json_response(status: StatusCode, value: &Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(value.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

async fn read_json<T: serde::de::DeserializeOwned>(body: Incoming) -> Result<T, HttpError> {
    let bytes = body
        .collect()
        .await
        .map_err(|e| HttpError::bad_request(format!("Failed to read body: {}", e)))?
        .to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn job_list(jobs: &[Job]) -> Value {
    json!({
        "count": jobs.len(),
        "jobs": jobs
            .iter()
            .map(|job| json!({ "id": job.id, "data": job.data }))
            .collect::<Vec<_>>(),
    })
}

async fn handle(
    router: Arc<matchit::Router<Route>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, HttpError> {
    let queues = Queues::from_request(&req)?;
    let path = req.uri().path().to_string();
    let matched = router
        .at(&path)
        .map_err(|_| HttpError::not_found(format!("No route found for {} {}", req.method(), path)))?;
    let route = *matched.value;
    let param = |name: &str| matched.params.get(name).unwrap_or_default().to_string();
    let method = req.method().clone();

    let body = match (method, route) {
        (Method::GET, Route::Index) => json!({ "name": "email-api", "queues": queues.queue_names() }),

        (Method::POST, Route::SendEmail) => {
            let email: EmailJob = read_json(req.into_body()).await?;
            let job = queues.typed::<EmailJob, Value>("emails")?.add(&email, None).await?;
            json!({ "success": true, "jobId": job.id })
        }

        (Method::GET, Route::EmailJobs) => {
            let jobs = queues.queue("emails")?.get_jobs(param("status")).await?;
            job_list(&jobs)
        }

        (Method::POST, Route::ScheduleReport) => {
            let report: ReportJob = read_json(req.into_body()).await?;
            let job = queues.typed::<ReportJob, Value>("reports")?.add(&report, None).await?;
            json!({ "success": true, "jobId": job.id })
        }

        (Method::POST, Route::ScheduleRecurringReport) => {
            let recurring: RecurringReport = read_json(req.into_body()).await?;
            let name = format!(
                "report-{}-{}",
                recurring.report.user_id, recurring.report.report_type
            );
            let job = queues
                .typed::<ReportJob, Value>("reports")?
                .add_cron(name, &recurring.report, &recurring.cron_pattern, None)
                .await?;
            json!({ "success": true, "jobId": job.id })
        }

        (Method::GET, Route::ReportJobs) => {
            let jobs = queues.queue("reports")?.get_jobs(param("status")).await?;
            job_list(&jobs)
        }

        (Method::GET, Route::Job) => {
            let job = queues
                .queue(&param("queue"))?
                .get_job(&param("id"))
                .await?
                .ok_or_else(|| HttpError::not_found("Job not found"))?;
            json!({
                "id": job.id,
                "data": job.data,
                "status": job.state,
                "result": job.return_value,
                "createdAt": job.timestamp,
            })
        }

        (Method::GET, Route::Counts) => {
            let counts = queues.queue(&param("queue"))?.get_job_counts().await?;
            serde_json::to_value(counts)?
        }

        (Method::POST, Route::Pause) => {
            queues.queue(&param("queue"))?.pause().await?;
            json!({ "success": true, "paused": true })
        }

        (Method::POST, Route::Resume) => {
            queues.queue(&param("queue"))?.resume().await?;
            json!({ "success": true, "paused": false })
        }

        (method, _) => {
            return Err(HttpError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "method_not_allowed",
                format!("Method {} not allowed for {}", method, path),
            ))
        }
    };

    Ok(json_response(StatusCode::OK, &body))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    quay_http::init_tracing();

    let connection = ConnectionOptions::from_env()?;
    tracing::info!(?connection, "Connecting queues");
    let plugin = QueuePlugin::new(config(connection))?;

    let router = Arc::new(routes()?);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        async move {
            let response = handle(router, req)
                .await
                .unwrap_or_else(HttpError::into_response);
            Ok::<_, Infallible>(response)
        }
    });

    let addr = std::env::var("ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server running at http://{}", addr);

    quay_http::serve(listener, plugin, service, shutdown_signal()).await?;
    Ok(())
}
