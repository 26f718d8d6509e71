//! Mapping of queue errors to HTTP responses

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::Full;
use quay_core::QueueError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Error returned to HTTP clients as a JSON body
///
/// ```json
/// { "error": { "type": "not_found", "message": "Queue emails not found" } }
/// ```
#[derive(Debug, Clone)]
pub struct HttpError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let body = ErrorResponse {
            error: ErrorBody {
                error_type: &self.error_type,
                message: &self.message,
            },
        };
        let body = serde_json::to_vec(&body).unwrap_or_else(|_| {
            br#"{"error":{"type":"internal_error","message":"Failed to serialize error"}}"#.to_vec()
        });

        let mut response = Response::new(Full::new(Bytes::from(body)));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

impl std::error::Error for HttpError {}

impl From<QueueError> for HttpError {
    fn from(err: QueueError) -> Self {
        match &err {
            QueueError::NotFound(_) => HttpError::not_found(err.to_string()),
            QueueError::InvalidStatus(_)
            | QueueError::InvalidCron { .. }
            | QueueError::InvalidPayload(_)
            | QueueError::InvalidOptions(_)
            | QueueError::Serialization(_) => HttpError::bad_request(err.to_string()),
            QueueError::Initialization(_) => {
                HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "initialization_error", err.to_string())
            }
            _ => {
                tracing::error!(error = %err, "Queue operation failed");
                HttpError::internal(err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for HttpError {
    fn from(err: serde_json::Error) -> Self {
        HttpError::bad_request(format!("Invalid JSON: {}", err))
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    #[serde(rename = "type")]
    error_type: &'a str,
    message: &'a str,
}

/// Failure of [`crate::serve`]
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("Queue lifecycle failed: {0}")]
    Queues(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn queue_errors_map_to_status_codes() {
        let cases = [
            (QueueError::NotFound("emails".into()), StatusCode::NOT_FOUND),
            (QueueError::InvalidStatus("bogus".into()), StatusCode::BAD_REQUEST),
            (QueueError::InvalidOptions("delay out of range".into()), StatusCode::BAD_REQUEST),
            (
                QueueError::InvalidCron {
                    pattern: "x".into(),
                    reason: "bad".into(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                QueueError::Initialization("Failed to initialize queues".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (QueueError::engine("store unreachable"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(HttpError::from(err).status, status);
        }
    }

    #[tokio::test]
    async fn response_body_is_json() {
        let response = HttpError::from(QueueError::NotFound("emails".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "not_found");
        assert_eq!(json["error"]["message"], "Queue emails not found");
    }
}
