//! Admission decisions and their rendering as rate-limit headers.

use crate::error::QuotaExceeded;
use http::header::{HeaderValue, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

/// `X-RateLimit-Limit`
pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
/// `X-RateLimit-Remaining`
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
/// `X-RateLimit-Reset` (seconds until the window ends)
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// Result of one record-and-check against a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request was admitted (and counted).
    pub admitted: bool,
    /// Slots left in the current window after this request.
    pub remaining: u32,
    /// Wait before a retry can succeed; zero when admitted.
    pub retry_after: Duration,
    /// The quota of the rule applied.
    pub limit: u32,
    /// Time until the current window ends.
    pub reset_after: Duration,
}

impl Decision {
    /// An admitted decision.
    pub fn admit(limit: u32, remaining: u32, reset_after: Duration) -> Self {
        Self { admitted: true, remaining, retry_after: Duration::ZERO, limit, reset_after }
    }

    /// A rejected decision; the window resets after `retry_after`.
    pub fn reject(limit: u32, retry_after: Duration) -> Self {
        Self { admitted: false, remaining: 0, retry_after, limit, reset_after: retry_after }
    }

    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        self.admitted
    }

    /// Turn a rejection into the caller-visible error.
    pub fn into_rejection(self, route: Arc<str>) -> Option<QuotaExceeded> {
        (!self.admitted).then(|| QuotaExceeded::quota(route, self.limit, self.retry_after))
    }

    /// Write `X-RateLimit-*` headers (and `Retry-After` when rejected).
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(ceil_secs(self.reset_after)));
        if !self.admitted {
            headers.insert(RETRY_AFTER, HeaderValue::from(ceil_secs(self.retry_after).max(1)));
        }
    }
}

impl QuotaExceeded {
    /// Write `Retry-After` and, when a rule was involved, `X-RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let secs = self.retry_after_secs();
        headers.insert(RETRY_AFTER, HeaderValue::from(secs));
        if let Some(limit) = self.limit {
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(0u32));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(secs));
        }
    }

    /// Standard over-limit response: `429`, rate-limit headers and a JSON body.
    ///
    /// Every cause maps to 429 so clients see a rate-limit category, never a server fault.
    pub fn to_response(&self) -> Response<String> {
        let body = serde_json::json!({
            "error": "rate_limited",
            "cause": self.cause.as_str(),
            "detail": self.to_string(),
            "retry_after": self.retry_after_secs(),
            "retry_after_ms": u64::try_from(self.retry_after.as_millis()).unwrap_or(u64::MAX),
        });
        let mut response = Response::new(body.to_string());
        *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
        let headers = response.headers_mut();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.apply_headers(headers);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectCause;

    #[test]
    fn admitted_headers() {
        let decision = Decision::admit(5, 3, Duration::from_millis(59_500));
        let mut headers = HeaderMap::new();
        decision.apply_headers(&mut headers);
        assert_eq!(headers[X_RATELIMIT_LIMIT], "5");
        assert_eq!(headers[X_RATELIMIT_REMAINING], "3");
        assert_eq!(headers[X_RATELIMIT_RESET], "60");
        assert!(headers.get(RETRY_AFTER).is_none());
    }

    #[test]
    fn rejection_converts_to_quota_exceeded() {
        let decision = Decision::reject(5, Duration::from_secs(50));
        let err = decision.into_rejection(Arc::from("/chat")).unwrap();
        assert_eq!(err.cause, RejectCause::Quota);
        assert_eq!(err.retry_after, Duration::from_secs(50));
        assert!(Decision::admit(5, 4, Duration::ZERO).into_rejection(Arc::from("/chat")).is_none());
    }

    #[test]
    fn over_limit_response_is_429_with_retry_after() {
        let err = QuotaExceeded::quota("/chat", 5, Duration::from_millis(49_100));
        let response = err.to_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "50");
        assert_eq!(response.headers()[X_RATELIMIT_REMAINING], "0");
        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["retry_after"], 50);
        assert_eq!(body["retry_after_ms"], 49_100);
        assert_eq!(body["cause"], "quota");
    }

    #[test]
    fn store_rejection_has_no_limit_headers() {
        let err = QuotaExceeded {
            route: "/r".into(),
            retry_after: Duration::from_secs(1),
            limit: None,
            cause: RejectCause::StoreUnavailable,
        };
        let response = err.to_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(X_RATELIMIT_LIMIT).is_none());
        assert_eq!(response.headers()[RETRY_AFTER], "1");
    }
}
