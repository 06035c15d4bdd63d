use crate::ratelimit::store::{CounterStore, WindowLimit};
use crate::ratelimit::window::{Granularity, RateWindowKey};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_PER_MINUTE: u64 = 60;
pub const DEFAULT_PER_HOUR: u64 = 1000;
pub const DEFAULT_WINDOW_SLACK: Duration = Duration::from_secs(5);

/// Admission decision for one request
///
/// Counts are the values after this request when admitted, the current
/// values when rejected, and zero when the store was unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub admitted: bool,
    pub minute_count: u64,
    pub hour_count: u64,
    pub minute_limit: u64,
    pub hour_limit: u64,
}

impl RateDecision {
    pub fn remaining_minute(&self) -> u64 {
        self.minute_limit.saturating_sub(self.minute_count)
    }

    pub fn remaining_hour(&self) -> u64 {
        self.hour_limit.saturating_sub(self.hour_count)
    }
}

/// Fixed-window limiter over per-minute and per-hour counters
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    per_minute: u64,
    per_hour: u64,
    window_slack: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, per_minute: u64, per_hour: u64) -> Self {
        Self {
            store,
            per_minute,
            per_hour,
            window_slack: DEFAULT_WINDOW_SLACK,
        }
    }

    pub fn with_window_slack(mut self, slack: Duration) -> Self {
        self.window_slack = slack;
        self
    }

    pub fn per_minute(&self) -> u64 {
        self.per_minute
    }

    pub fn per_hour(&self) -> u64 {
        self.per_hour
    }

    pub async fn check_and_consume(&self, subject: &str, endpoint: &str) -> RateDecision {
        self.check_and_consume_at(subject, endpoint, Utc::now()).await
    }

    /// Same as [`check_and_consume`](Self::check_and_consume) with an explicit clock
    pub async fn check_and_consume_at(
        &self,
        subject: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let limits = [
            self.window_limit(subject, endpoint, Granularity::Minute, self.per_minute, now),
            self.window_limit(subject, endpoint, Granularity::Hour, self.per_hour, now),
        ];

        match self.store.check_and_increment(&limits).await {
            Ok(outcome) => {
                let count = |i: usize| outcome.counts.get(i).copied().unwrap_or(0);
                let decision = RateDecision {
                    admitted: outcome.admitted,
                    minute_count: count(0),
                    hour_count: count(1),
                    minute_limit: self.per_minute,
                    hour_limit: self.per_hour,
                };

                if decision.admitted {
                    crate::metrics::record_rate_limit_decision("admitted");
                } else {
                    tracing::info!(
                        subject = %subject,
                        endpoint = %endpoint,
                        minute_count = decision.minute_count,
                        hour_count = decision.hour_count,
                        "Rate limit exceeded"
                    );
                    crate::metrics::record_rate_limit_decision("rejected");
                }
                decision
            }
            Err(e) => {
                // Fail open
                tracing::warn!(
                    subject = %subject,
                    endpoint = %endpoint,
                    error = %e,
                    "Counter store unavailable, admitting request"
                );
                crate::metrics::record_counter_store_error();
                crate::metrics::record_rate_limit_decision("fail_open");

                RateDecision {
                    admitted: true,
                    minute_count: 0,
                    hour_count: 0,
                    minute_limit: self.per_minute,
                    hour_limit: self.per_hour,
                }
            }
        }
    }

    fn window_limit(
        &self,
        subject: &str,
        endpoint: &str,
        granularity: Granularity,
        ceiling: u64,
        now: DateTime<Utc>,
    ) -> WindowLimit {
        WindowLimit {
            key: RateWindowKey::at(subject, endpoint, granularity, now).to_string(),
            ceiling,
            ttl: granularity.window() + self.window_slack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CounterStoreError;
    use crate::ratelimit::store::{MemoryCounterStore, WindowOutcome};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".to_string()))
        }

        async fn get(&self, _key: &str) -> Result<Option<u64>, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".to_string()))
        }

        async fn check_and_increment(
            &self,
            _limits: &[WindowLimit],
        ) -> Result<WindowOutcome, CounterStoreError> {
            Err(CounterStoreError::Unavailable("connection refused".to_string()))
        }
    }

    fn limiter(per_minute: u64, per_hour: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCounterStore::new()), per_minute, per_hour)
    }

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, minute, second).unwrap()
    }

    #[tokio::test]
    async fn test_ceiling_three_per_minute() {
        let limiter = limiter(3, 1000);

        let mut admitted = Vec::new();
        let mut counts = Vec::new();
        for i in 0..5 {
            let decision = limiter
                .check_and_consume_at("u1", "/api/events", at(10, 0, i))
                .await;
            admitted.push(decision.admitted);
            counts.push(decision.minute_count);
        }

        assert_eq!(admitted, vec![true, true, true, false, false]);
        assert_eq!(counts, vec![1, 2, 3, 3, 3]);
    }

    #[tokio::test]
    async fn test_exactly_next_call_rejected() {
        for n in [1u64, 60] {
            let limiter = limiter(n, 1000);
            for i in 0..n {
                let decision = limiter
                    .check_and_consume_at("u1", "/x", at(10, 0, (i % 60) as u32))
                    .await;
                assert!(decision.admitted, "call {} of {} should pass", i + 1, n);
            }
            let decision = limiter.check_and_consume_at("u1", "/x", at(10, 0, 59)).await;
            assert!(!decision.admitted, "call {} should be rejected", n + 1);
            assert_eq!(decision.minute_count, n);
        }
    }

    #[tokio::test]
    async fn test_hour_ceiling_spans_minutes() {
        let limiter = limiter(10, 3);

        assert!(limiter.check_and_consume_at("u1", "/x", at(9, 0, 0)).await.admitted);
        assert!(limiter.check_and_consume_at("u1", "/x", at(9, 10, 0)).await.admitted);
        assert!(limiter.check_and_consume_at("u1", "/x", at(9, 20, 0)).await.admitted);

        let decision = limiter.check_and_consume_at("u1", "/x", at(9, 30, 0)).await;
        assert!(!decision.admitted);
        assert_eq!(decision.minute_count, 0);
        assert_eq!(decision.hour_count, 3);

        assert!(limiter.check_and_consume_at("u1", "/x", at(10, 0, 0)).await.admitted);
    }

    #[tokio::test]
    async fn test_next_minute_starts_fresh() {
        let limiter = limiter(2, 1000);

        limiter.check_and_consume_at("u1", "/x", at(9, 0, 10)).await;
        limiter.check_and_consume_at("u1", "/x", at(9, 0, 20)).await;
        assert!(!limiter.check_and_consume_at("u1", "/x", at(9, 0, 30)).await.admitted);

        let decision = limiter.check_and_consume_at("u1", "/x", at(9, 1, 0)).await;
        assert!(decision.admitted);
        assert_eq!(decision.minute_count, 1);
        assert_eq!(decision.hour_count, 3);
    }

    #[tokio::test]
    async fn test_subjects_and_endpoints_are_independent() {
        let limiter = limiter(1, 1000);

        assert!(limiter.check_and_consume_at("u1", "/a", at(9, 0, 0)).await.admitted);
        assert!(limiter.check_and_consume_at("u2", "/a", at(9, 0, 0)).await.admitted);
        assert!(limiter.check_and_consume_at("u1", "/b", at(9, 0, 0)).await.admitted);
        assert!(!limiter.check_and_consume_at("u1", "/a", at(9, 0, 1)).await.admitted);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 1, 1);

        for _ in 0..3 {
            let decision = limiter.check_and_consume("u1", "/x").await;
            assert!(decision.admitted);
            assert_eq!(decision.minute_count, 0);
            assert_eq!(decision.hour_count, 0);
            assert_eq!(decision.remaining_minute(), 1);
        }
    }

    #[tokio::test]
    async fn test_remaining_quota() {
        let limiter = limiter(3, 5);

        let decision = limiter.check_and_consume_at("u1", "/x", at(9, 0, 0)).await;
        assert_eq!(decision.remaining_minute(), 2);
        assert_eq!(decision.remaining_hour(), 4);
    }

    #[tokio::test]
    async fn test_decision_metric_ignores_request_path() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let limiter = limiter(1, 1000);
        for i in 0..20 {
            let path = format!("/missing-{}", i);
            limiter.check_and_consume_at("u1", &path, at(9, 0, 0)).await;
            limiter.check_and_consume_at("u1", &path, at(9, 0, 1)).await;
        }

        let rendered = handle.render();
        let series: Vec<&str> = rendered
            .lines()
            .filter(|line| line.starts_with("rate_limit_decisions_total{"))
            .collect();

        assert_eq!(series.len(), 2, "{}", rendered);
        assert!(!rendered.contains("/missing-"));
        assert!(series.iter().any(|line| line.contains(r#"outcome="admitted"} 20"#)));
        assert!(series.iter().any(|line| line.contains(r#"outcome="rejected"} 20"#)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_racers_never_exceed_ceiling() {
        let limiter = limiter(10, 1000);
        let now = at(12, 0, 0);

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check_and_consume_at("racer", "/x", now).await })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().admitted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
