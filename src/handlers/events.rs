use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    error::AppError,
    handlers::AppState,
    pricing::PricingTable,
    telemetry::{
        event::{tokens_per_second, truncate_error_message},
        Component, RequestStatus, TelemetryEvent, UserRole,
    },
};

/// Body of `POST /api/events`
///
/// Only the requester, model and latency are required. Cost is computed from
/// the pricing table when omitted; timestamp and request id are filled in.
#[derive(Debug, Deserialize)]
pub struct SubmitEventRequest {
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub user_id: String,
    #[serde(default)]
    pub user_role: UserRole,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    pub latency_ms: u64,
    #[serde(default)]
    pub ttft_ms: Option<u64>,
    #[serde(default)]
    pub tokens_per_second: Option<f64>,
    #[serde(default)]
    pub cost_usd: Option<Decimal>,
    #[serde(default = "default_status")]
    pub status: RequestStatus,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub component: Component,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

fn default_status() -> RequestStatus {
    RequestStatus::Success
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitEventResponse {
    pub accepted: bool,
    pub request_id: String,
}

impl SubmitEventRequest {
    /// Validate and fill defaults
    pub fn into_event(self, pricing: &PricingTable) -> Result<TelemetryEvent, AppError> {
        if self.user_id.trim().is_empty() {
            return Err(AppError::InvalidEvent("user_id cannot be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(AppError::InvalidEvent("model cannot be empty".to_string()));
        }

        let cost_usd = match self.cost_usd {
            Some(cost) if cost.is_sign_negative() => {
                return Err(AppError::InvalidEvent("cost_usd cannot be negative".to_string()));
            }
            Some(cost) => cost,
            None => pricing.calculate_cost(&self.model, self.input_tokens, self.output_tokens),
        };

        let tokens_per_second = self
            .tokens_per_second
            .or_else(|| tokens_per_second(self.output_tokens, self.latency_ms));

        Ok(TelemetryEvent {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            user_id: self.user_id,
            user_role: self.user_role,
            model: self.model,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            latency_ms: self.latency_ms,
            ttft_ms: self.ttft_ms,
            tokens_per_second,
            cost_usd,
            status: self.status,
            error_type: self.error_type,
            error_message: self.error_message.as_deref().map(truncate_error_message),
            component: self.component,
            cache_hit: self.cache_hit,
            trace_id: self.trace_id,
            span_id: self.span_id,
            request_id: self
                .request_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        })
    }
}

/// Handle `POST /api/events`
///
/// Always 202 once the body is valid; `accepted: false` means the pipeline
/// dropped the event. Bodies that fail to parse get the same 400 as bodies
/// that fail validation.
pub async fn submit_event(
    State(state): State<AppState>,
    payload: Result<Json<SubmitEventRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitEventResponse>), AppError> {
    let Json(request) = payload?;
    let event = request.into_event(&state.pricing)?;
    let request_id = event.request_id.clone();

    let accepted = state.submit_event(event);
    if accepted {
        tracing::debug!(request_id = %request_id, "Telemetry event queued");
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitEventResponse {
            accepted,
            request_id,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn request(json: serde_json::Value) -> SubmitEventRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_minimal_request_gets_defaults() {
        let req = request(serde_json::json!({
            "user_id": "erin",
            "model": "mixtral-8x7b-32768",
            "input_tokens": 1000,
            "output_tokens": 1000,
            "latency_ms": 2000
        }));
        let event = req.into_event(&PricingTable::default()).unwrap();

        assert_eq!(event.user_role, UserRole::Employee);
        assert_eq!(event.status, RequestStatus::Success);
        assert_eq!(event.component, Component::ApiRouter);
        assert_eq!(event.cost_usd, Decimal::from_str("0.00048").unwrap());
        assert_eq!(event.tokens_per_second, Some(500.0));
        assert!(!event.request_id.is_empty());
    }

    #[test]
    fn test_explicit_cost_and_ids_kept() {
        let req = request(serde_json::json!({
            "user_id": "erin",
            "user_role": "admin",
            "model": "gemma-7b-it",
            "latency_ms": 10,
            "cost_usd": "0.125",
            "status": "rate_limited",
            "component": "pii_firewall",
            "request_id": "req-42"
        }));
        let event = req.into_event(&PricingTable::default()).unwrap();

        assert_eq!(event.user_role, UserRole::Admin);
        assert_eq!(event.status, RequestStatus::RateLimited);
        assert_eq!(event.component, Component::PiiFirewall);
        assert_eq!(event.cost_usd, Decimal::from_str("0.125").unwrap());
        assert_eq!(event.request_id, "req-42");
    }

    #[test]
    fn test_rejects_empty_user() {
        let req = request(serde_json::json!({
            "user_id": " ",
            "model": "gemma-7b-it",
            "latency_ms": 10
        }));
        let err = req.into_event(&PricingTable::default()).unwrap_err();
        assert!(matches!(err, AppError::InvalidEvent(_)));
    }

    #[test]
    fn test_rejects_negative_cost() {
        let req = request(serde_json::json!({
            "user_id": "erin",
            "model": "gemma-7b-it",
            "latency_ms": 10,
            "cost_usd": "-1"
        }));
        assert!(req.into_event(&PricingTable::default()).is_err());
    }

    #[test]
    fn test_long_error_message_truncated() {
        let req = request(serde_json::json!({
            "user_id": "erin",
            "model": "gemma-7b-it",
            "latency_ms": 10,
            "status": "error",
            "error_message": "x".repeat(2000)
        }));
        let event = req.into_event(&PricingTable::default()).unwrap();

        let message = event.error_message.unwrap();
        assert!(message.len() < 2000);
        assert!(message.ends_with("..."));
    }
}
