//! Telemetry record describing one call to an upstream language model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum stored length of an error message
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Role of the user who issued the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    #[default]
    Employee,
    Manager,
    Admin,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Manager => "manager",
            Self::Admin => "admin",
        }
    }
}

/// Outcome of the upstream call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Error,
    Timeout,
    RateLimited,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Component of the serving stack that produced the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    #[default]
    ApiRouter,
    SemanticCache,
    AiRouter,
    LlamaGuard,
    Rbac,
    NemoGuardrails,
    PiiFirewall,
    GroqClient,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiRouter => "api_router",
            Self::SemanticCache => "semantic_cache",
            Self::AiRouter => "ai_router",
            Self::LlamaGuard => "llama_guard",
            Self::Rbac => "rbac",
            Self::NemoGuardrails => "nemo_guardrails",
            Self::PiiFirewall => "pii_firewall",
            Self::GroqClient => "groq_client",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single telemetry record
///
/// Created by a producer when an upstream call completes (successfully or not)
/// and owned by the pipeline until it is flushed to the durable sink.
/// `request_id` is the natural key: one record per logical call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub user_role: UserRole,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub ttft_ms: Option<u64>,
    pub tokens_per_second: Option<f64>,
    pub cost_usd: Decimal,
    pub status: RequestStatus,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub component: Component,
    pub cache_hit: bool,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub request_id: String,
}

impl TelemetryEvent {
    pub fn total_tokens(&self) -> u64 {
        u64::from(self.input_tokens) + u64::from(self.output_tokens)
    }

    pub fn is_error(&self) -> bool {
        self.status != RequestStatus::Success
    }
}

/// Output throughput of a call, `None` when the latency is zero
pub fn tokens_per_second(output_tokens: u32, latency_ms: u64) -> Option<f64> {
    if latency_ms == 0 {
        return None;
    }
    Some(f64::from(output_tokens) / (latency_ms as f64 / 1000.0))
}

/// Truncate an error message to `MAX_ERROR_MESSAGE_LEN` bytes on a char boundary
pub fn truncate_error_message(message: &str) -> String {
    if message.len() <= MAX_ERROR_MESSAGE_LEN {
        return message.to_string();
    }

    let mut end = MAX_ERROR_MESSAGE_LEN - 3;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}
