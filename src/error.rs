use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a durable sink while writing a batch
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("sink write timed out after {0:?}")]
    Timeout(Duration),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a counter store backing the rate limiter
#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter '{key}' holds an invalid value: {value}")]
    InvalidValue { key: String, value: i64 },
}

/// Why an event was not accepted into the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("event queue is full")]
    Full,

    #[error("event queue is closed")]
    Closed,
}

impl QueueError {
    /// Label used for the drop counter
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Closed => "closed",
        }
    }
}

/// Errors surfaced by the HTTP layer
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidEvent(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type_name(&self),
            }
        }));

        (status, body).into_response()
    }
}

fn error_type_name(error: &AppError) -> &'static str {
    match error {
        AppError::InvalidEvent(_) => "invalid_event",
        AppError::RateLimited => "rate_limited",
        AppError::InternalError(_) => "internal_error",
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidEvent(rejection.body_text())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AppError::InvalidEvent("user_id must not be empty".to_string());
        assert_eq!(error.to_string(), "Invalid event: user_id must not be empty");

        let error = SinkError::Timeout(Duration::from_secs(2));
        assert_eq!(error.to_string(), "sink write timed out after 2s");
    }

    #[test]
    fn test_error_type_name() {
        assert_eq!(error_type_name(&AppError::RateLimited), "rate_limited");
        assert_eq!(
            error_type_name(&AppError::InvalidEvent("x".to_string())),
            "invalid_event"
        );
    }

    #[test]
    fn test_queue_error_reason() {
        assert_eq!(QueueError::Full.reason(), "full");
        assert_eq!(QueueError::Closed.reason(), "closed");
    }

    #[tokio::test]
    async fn test_error_response() {
        let response = AppError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = AppError::InvalidEvent("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
