use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

/// Advisory headers sent on both the allow and the deny path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitHeaders {
    /// Resolved refill rate, tokens per second.
    pub limit: f64,
    pub remaining: u32,
    /// Unix seconds at which another token is available.
    pub reset: u64,
    /// Whole seconds until another token is available, at least 1.
    pub retry_after: u64,
}

impl RateLimitHeaders {
    pub fn new(limit: f64, remaining: u32, until_next_token: Duration) -> Self {
        let retry_after = (until_next_token.as_secs_f64().ceil() as u64).max(1);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            limit,
            remaining,
            reset: now.saturating_add(retry_after),
            retry_after,
        }
    }

    pub fn apply(&self, headers: &mut HeaderMap) {
        if let Ok(limit) = HeaderValue::from_str(&format_rate(self.limit)) {
            headers.insert(X_RATELIMIT_LIMIT, limit);
        }
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset));
    }
}

/// Whole rates print without a fractional part.
fn format_rate(rate: f64) -> String {
    if rate.fract() == 0.0 && rate.abs() < u64::MAX as f64 {
        format!("{}", rate as u64)
    } else {
        format!("{}", rate)
    }
}

/// Body of a 429 response.
#[derive(Debug, Clone, Serialize)]
pub struct RejectionBody {
    pub error: String,
    pub code: &'static str,
    pub retry_after: u64,
}

/// A denied request: 429, rate limit headers, `Retry-After` and a
/// structured body.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub headers: RateLimitHeaders,
    pub message: String,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let body = RejectionBody {
            error: self.message,
            code: RATE_LIMIT_EXCEEDED,
            retry_after: self.headers.retry_after,
        };

        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        self.headers.apply(headers);
        headers.insert(RETRY_AFTER, HeaderValue::from(self.headers.retry_after));
        response
    }
}

/// Body of the sidecar check endpoint on the allow path.
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub bypassed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<u64>,
}

impl CheckResponse {
    pub fn allowed(headers: &RateLimitHeaders) -> Self {
        Self {
            allowed: true,
            bypassed: false,
            limit: Some(headers.limit),
            remaining: Some(headers.remaining),
            reset: Some(headers.reset),
        }
    }

    pub fn bypassed() -> Self {
        Self {
            allowed: true,
            bypassed: true,
            limit: None,
            remaining: None,
            reset: None,
        }
    }
}

/// Envelope for successful administrative responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    pub message: String,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn new(data: T, message: impl Into<String>) -> Self {
        Self {
            data,
            message: message.into(),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        Json(self).into_response()
    }
}
