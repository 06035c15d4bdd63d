pub mod events;
pub mod health;
pub mod metrics_handler;

use crate::{
    pricing::PricingTable,
    ratelimit::{RateDecision, RateLimiter},
    telemetry::{TelemetryEvent, TelemetryPipeline},
};
use std::sync::Arc;

/// Shared state for the API routes and the rate-limit middleware
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<TelemetryPipeline>,
    /// `None` when rate limiting is disabled
    pub limiter: Option<RateLimiter>,
    pub pricing: Arc<PricingTable>,
    pub exempt_paths: Arc<Vec<String>>,
}

impl AppState {
    /// Enqueue an event without blocking, `false` if it was dropped
    pub fn submit_event(&self, event: TelemetryEvent) -> bool {
        self.pipeline.submit_event(event)
    }

    /// Admission decision for `subject` on `endpoint`, `None` when limiting is off
    pub async fn check_rate_limit(&self, subject: &str, endpoint: &str) -> Option<RateDecision> {
        match &self.limiter {
            Some(limiter) => Some(limiter.check_and_consume(subject, endpoint).await),
            None => None,
        }
    }

    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| exempt == path)
    }
}
