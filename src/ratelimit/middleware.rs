use crate::{error::AppError, handlers::AppState, ratelimit::RateDecision};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// Header carrying the caller identity used as the rate-limit subject
pub const USER_ID_HEADER: &str = "x-user-id";

/// Subject for requests without an identity header
pub const ANONYMOUS_SUBJECT: &str = "anonymous";

const LIMIT_MINUTE: HeaderName = HeaderName::from_static("x-ratelimit-limit-minute");
const LIMIT_HOUR: HeaderName = HeaderName::from_static("x-ratelimit-limit-hour");
const REMAINING_MINUTE: HeaderName = HeaderName::from_static("x-ratelimit-remaining-minute");
const REMAINING_HOUR: HeaderName = HeaderName::from_static("x-ratelimit-remaining-hour");

/// Rate limiting middleware
///
/// Subject comes from `X-User-ID`, endpoint is the request path. Rejected
/// requests never reach the handler. Quota headers are set on every limited
/// response, admitted or not.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if state.is_exempt(&path) {
        return next.run(req).await;
    }

    let subject = subject_from_headers(req.headers());

    let Some(decision) = state.check_rate_limit(&subject, &path).await else {
        return next.run(req).await;
    };

    let mut response = if decision.admitted {
        next.run(req).await
    } else {
        AppError::RateLimited.into_response()
    };

    apply_quota_headers(response.headers_mut(), &decision);
    response
}

fn subject_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_SUBJECT)
        .to_string()
}

fn apply_quota_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    let pairs = [
        (LIMIT_MINUTE, decision.minute_limit),
        (LIMIT_HOUR, decision.hour_limit),
        (REMAINING_MINUTE, decision.remaining_minute()),
        (REMAINING_HOUR, decision.remaining_hour()),
    ];
    for (name, value) in pairs {
        headers.insert(name, HeaderValue::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_defaults_to_anonymous() {
        let mut headers = HeaderMap::new();
        assert_eq!(subject_from_headers(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(subject_from_headers(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("dave"));
        assert_eq!(subject_from_headers(&headers), "dave");
    }

    #[test]
    fn test_quota_headers() {
        let decision = RateDecision {
            admitted: false,
            minute_count: 60,
            hour_count: 75,
            minute_limit: 60,
            hour_limit: 1000,
        };
        let mut headers = HeaderMap::new();
        apply_quota_headers(&mut headers, &decision);

        assert_eq!(headers["x-ratelimit-limit-minute"], "60");
        assert_eq!(headers["x-ratelimit-limit-hour"], "1000");
        assert_eq!(headers["x-ratelimit-remaining-minute"], "0");
        assert_eq!(headers["x-ratelimit-remaining-hour"], "925");
    }
}
