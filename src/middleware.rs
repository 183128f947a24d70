use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AdmissionError, Result};
use crate::key_generator::{extract_client_ip, identity_from_headers, CallerContext, Identity};
use crate::policy::{CategoryPolicy, PolicyConfig};
use crate::rate_limiter::LimiterRegistry;
use crate::response::{RateLimitHeaders, Rejection};
use crate::telemetry::TelemetryCollector;

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub enum Admission {
    /// The category is disabled; nothing was checked or recorded.
    PassThrough,
    /// The caller's role is exempt from admission control.
    Bypassed,
    Allowed(RateLimitHeaders),
    Denied(Rejection),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied(_))
    }
}

/// Records the outcome when dropped, so telemetry is written even when
/// the downstream handler fails or the request future is abandoned.
#[derive(Debug)]
struct RecordGuard<'a> {
    telemetry: &'a TelemetryCollector,
    key: String,
    limited: bool,
    started: Instant,
}

impl Drop for RecordGuard<'_> {
    fn drop(&mut self) {
        self.telemetry
            .record(&self.key, self.limited, self.started.elapsed());
    }
}

/// An admission decision whose telemetry is recorded when the ticket is
/// dropped.
#[must_use = "telemetry is recorded when the ticket is dropped"]
#[derive(Debug)]
pub struct Ticket<'a> {
    admission: Admission,
    _record: Option<RecordGuard<'a>>,
}

impl Ticket<'_> {
    pub fn admission(&self) -> &Admission {
        &self.admission
    }
}

/// Admission control for one request category.
#[derive(Debug)]
pub struct AdmissionMiddleware {
    name: String,
    policy: Option<CategoryPolicy>,
    limiter: LimiterRegistry,
    telemetry: TelemetryCollector,
}

impl AdmissionMiddleware {
    pub fn new(policy: CategoryPolicy, telemetry_window: Duration) -> Self {
        Self {
            name: policy.name().to_string(),
            policy: Some(policy),
            limiter: LimiterRegistry::new(),
            telemetry: TelemetryCollector::new(telemetry_window),
        }
    }

    /// A middleware that forwards everything and records nothing.
    pub fn pass_through(name: impl Into<String>, telemetry_window: Duration) -> Self {
        Self {
            name: name.into(),
            policy: None,
            limiter: LimiterRegistry::new(),
            telemetry: TelemetryCollector::new(telemetry_window),
        }
    }

    pub fn from_config(
        name: &str,
        config: &PolicyConfig,
        telemetry_window: Duration,
        globally_enabled: bool,
    ) -> Result<Self> {
        let policy = CategoryPolicy::from_config(name, config)?;
        if globally_enabled && config.enabled {
            Ok(Self::new(policy, telemetry_window))
        } else {
            Ok(Self::pass_through(name, telemetry_window))
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.is_some()
    }

    pub fn policy(&self) -> Option<&CategoryPolicy> {
        self.policy.as_ref()
    }

    pub fn limiter(&self) -> &LimiterRegistry {
        &self.limiter
    }

    pub fn telemetry(&self) -> &TelemetryCollector {
        &self.telemetry
    }

    /// Decide admission for `caller`. Telemetry is recorded when the
    /// returned ticket is dropped, so the measured latency covers whatever
    /// the caller does while holding it.
    pub fn begin(&self, caller: &CallerContext) -> Ticket<'_> {
        let started = Instant::now();
        let Some(policy) = &self.policy else {
            return Ticket {
                admission: Admission::PassThrough,
                _record: None,
            };
        };

        let resolution = policy.resolve(caller);
        let record = |limited: bool| RecordGuard {
            telemetry: &self.telemetry,
            key: resolution.key.clone(),
            limited,
            started,
        };

        if resolution.skip {
            return Ticket {
                admission: Admission::Bypassed,
                _record: Some(record(false)),
            };
        }

        let decision = self
            .limiter
            .check(&resolution.key, resolution.rate, resolution.burst);
        let headers = RateLimitHeaders::new(resolution.rate, decision.remaining, decision.retry_after);

        if decision.allowed {
            Ticket {
                admission: Admission::Allowed(headers),
                _record: Some(record(false)),
            }
        } else {
            debug!(
                target: "admission::middleware",
                category = %self.name,
                key = %resolution.key,
                rate = resolution.rate,
                burst = resolution.burst,
                "request denied"
            );
            Ticket {
                admission: Admission::Denied(Rejection {
                    headers,
                    message: policy.deny_message().to_string(),
                }),
                _record: Some(record(true)),
            }
        }
    }

    /// Decide and record in one synchronous call.
    pub fn admit(&self, caller: &CallerContext) -> Admission {
        let ticket = self.begin(caller);
        ticket.admission.clone()
    }

    /// Wait for admission instead of being denied. Returns
    /// [`AdmissionError::Cancelled`] when the caller's cancellation token
    /// fires first; the attempt is then recorded as limited.
    pub async fn admit_eventually(&self, caller: &CallerContext) -> Result<Admission> {
        let started = Instant::now();
        let Some(policy) = &self.policy else {
            return Ok(Admission::PassThrough);
        };

        let resolution = policy.resolve(caller);
        if resolution.skip {
            self.telemetry
                .record(&resolution.key, false, started.elapsed());
            return Ok(Admission::Bypassed);
        }

        let waited = self
            .limiter
            .wait(&resolution.key, resolution.rate, resolution.burst, &caller.cancel)
            .await;
        self.telemetry
            .record(&resolution.key, waited.is_err(), started.elapsed());
        let decision = waited?;

        let headers = RateLimitHeaders::new(resolution.rate, decision.remaining, decision.retry_after);
        Ok(Admission::Allowed(headers))
    }
}

fn caller_from_request(request: &Request) -> CallerContext {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let origin = extract_client_ip(request.headers(), peer);

    match request.extensions().get::<Identity>() {
        Some(identity) => CallerContext::authenticated(origin, identity.clone()),
        None => CallerContext::anonymous(origin),
    }
}

/// Admission control for a route group.
///
/// ```ignore
/// Router::new()
///     .route("/speech/recognize", post(recognize))
///     .layer(middleware::from_fn_with_state(registry.require("speech")?, enforce));
/// ```
pub async fn enforce(
    State(admission): State<Arc<AdmissionMiddleware>>,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_from_request(&request);
    let ticket = admission.begin(&caller);

    match ticket.admission().clone() {
        Admission::PassThrough | Admission::Bypassed => next.run(request).await,
        Admission::Allowed(headers) => {
            let mut response = next.run(request).await;
            headers.apply(response.headers_mut());
            response
        }
        Admission::Denied(rejection) => rejection.into_response(),
    }
}

/// Attach an [`Identity`] built from trusted gateway headers, unless the
/// authentication layer already provided one.
pub async fn gateway_identity(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<Identity>().is_none() {
        if let Some(identity) = identity_from_headers(request.headers()) {
            request.extensions_mut().insert(identity);
        }
    }
    next.run(request).await
}

/// Logging middleware for request/response tracking
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let request_id = Uuid::new_v4();
    let client_ip = caller_from_request(&request).origin;

    info!(
        target: "admission::middleware",
        %request_id,
        method = %method,
        uri = %uri,
        client_ip = %client_ip,
        "Incoming request"
    );

    let mut response = next.run(request).await;

    if let Ok(value) = request_id.to_string().parse() {
        response.headers_mut().insert("x-request-id", value);
    }

    info!(
        target: "admission::middleware",
        %request_id,
        method = %method,
        uri = %uri,
        status = %response.status(),
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_generator::KeyStrategy;
    use tokio_util::sync::CancellationToken;

    fn middleware(config: PolicyConfig) -> AdmissionMiddleware {
        AdmissionMiddleware::from_config("auth", &config, Duration::from_secs(300), true).unwrap()
    }

    #[test]
    fn test_auth_scenario() {
        let auth = middleware(PolicyConfig::new(10.0, 20, KeyStrategy::Origin));
        let caller = CallerContext::anonymous("192.168.1.1");

        let outcomes: Vec<bool> = (0..25).map(|_| auth.admit(&caller).is_allowed()).collect();
        assert!(outcomes[..20].iter().all(|allowed| *allowed));
        assert!(outcomes[20..].iter().all(|allowed| !*allowed));

        let stats = auth.telemetry().stats("ip:192.168.1.1").unwrap();
        assert_eq!(stats.total_requests, 25);
        assert_eq!(stats.limited_requests, 5);
    }

    #[test]
    fn test_origin_keying_ignores_identity_rotation() {
        let auth = middleware(PolicyConfig::new(1.0, 2, KeyStrategy::Origin));
        for user in ["1", "2", "3"] {
            let caller = CallerContext::authenticated("10.0.0.9", Identity::new(user, "common"));
            auth.admit(&caller);
        }
        assert_eq!(auth.limiter().len(), 1);
        let stats = auth.telemetry().stats("ip:10.0.0.9").unwrap();
        assert_eq!(stats.limited_requests, 1);
    }

    #[test]
    fn test_skip_bypass() {
        let speech = middleware(
            PolicyConfig::new(1.0, 1, KeyStrategy::IdentityOrOrigin).with_skip_role("super_admin"),
        );
        let admin = CallerContext::authenticated("10.0.0.1", Identity::new("1", "super_admin"));

        for _ in 0..10 {
            assert!(matches!(speech.admit(&admin), Admission::Bypassed));
        }
        assert!(speech.limiter().is_empty());

        let stats = speech.telemetry().stats("user:1").unwrap();
        assert_eq!(stats.total_requests, 10);
        assert_eq!(stats.limited_requests, 0);
    }

    #[test]
    fn test_disabled_category_passes_through() {
        let upload = middleware(PolicyConfig::new(1.0, 1, KeyStrategy::Origin).disabled());
        let caller = CallerContext::anonymous("10.0.0.1");

        assert!(!upload.is_enabled());
        for _ in 0..5 {
            assert!(matches!(upload.admit(&caller), Admission::PassThrough));
        }
        assert!(upload.telemetry().is_empty());
        assert!(upload.limiter().is_empty());
    }

    #[test]
    fn test_globally_disabled() {
        let config = PolicyConfig::new(1.0, 1, KeyStrategy::Origin);
        let auth = AdmissionMiddleware::from_config("auth", &config, Duration::from_secs(60), false).unwrap();
        assert!(!auth.is_enabled());
    }

    #[test]
    fn test_role_headers() {
        let speech = middleware(
            PolicyConfig::new(50.0, 100, KeyStrategy::IdentityOrOrigin).with_role("member", 200.0, 400),
        );
        let member = CallerContext::authenticated("10.0.0.1", Identity::new("5", "member"));

        match speech.admit(&member) {
            Admission::Allowed(headers) => {
                assert_eq!(headers.limit, 200.0);
                assert_eq!(headers.remaining, 399);
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_ticket_records_on_drop() {
        let auth = middleware(PolicyConfig::new(10.0, 20, KeyStrategy::Origin));
        let caller = CallerContext::anonymous("10.0.0.1");

        let ticket = auth.begin(&caller);
        assert!(auth.telemetry().stats("ip:10.0.0.1").is_none());
        drop(ticket);
        assert_eq!(auth.telemetry().stats("ip:10.0.0.1").unwrap().total_requests, 1);
    }

    #[tokio::test]
    async fn test_admit_eventually_cancelled() {
        let auth = middleware(PolicyConfig::new(0.001, 1, KeyStrategy::Origin));
        let cancel = CancellationToken::new();
        let caller = CallerContext::anonymous("10.0.0.1").with_cancel(cancel.clone());

        assert!(auth.admit(&caller).is_allowed());
        cancel.cancel();

        let result = auth.admit_eventually(&caller).await;
        assert!(matches!(result, Err(AdmissionError::Cancelled)));
        let stats = auth.telemetry().stats("ip:10.0.0.1").unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.limited_requests, 1);
    }

    #[tokio::test]
    async fn test_admit_eventually_waits_for_refill() {
        let auth = middleware(PolicyConfig::new(20.0, 1, KeyStrategy::Origin));
        let caller = CallerContext::anonymous("10.0.0.1");

        assert!(auth.admit(&caller).is_allowed());
        let admission = auth.admit_eventually(&caller).await.unwrap();
        assert!(matches!(admission, Admission::Allowed(_)));
    }
}
