//! [`RateLimitMiddleware`] and client identification.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::RateLimiter;
use crate::{
    Response, StatusCode,
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

/// Identifies the caller of a request.
///
/// In order of preference: `X-API-Key` (as `key:<value>`), the first
/// `X-Forwarded-For` hop, `X-Real-IP`, the socket peer address (all as
/// `ip:<addr>`), else `anonymous`.
pub fn client_id(ctx: &Context) -> String {
    let request = ctx.request();
    let headers = request.headers();

    if let Some(key) = headers.get("x-api-key").map(str::trim).filter(|k| !k.is_empty()) {
        return format!("key:{key}");
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    let real_ip = || {
        headers
            .get("x-real-ip")
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };
    if let Some(ip) = forwarded.or_else(real_ip) {
        return format!("ip:{ip}");
    }
    match request.remote_addr() {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "anonymous".to_owned(),
    }
}

/// Rejects requests over budget with `429 Too Many Requests` and decorates
/// admitted responses with `X-RateLimit-*` headers.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use cadence::cache::Cache;
/// use cadence::clock::SystemClock;
/// use cadence::config::{CacheConfig, RateLimitConfig};
/// use cadence::context::Context;
/// use cadence::http::{Response, StatusCode};
/// use cadence::middleware::Pipeline;
/// use cadence::security::{RateLimitMiddleware, RateLimiter};
///
/// let clock = SystemClock::shared();
/// let cache = Arc::new(Cache::new(&CacheConfig::default(), clock.clone()));
/// let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default(), cache, clock));
///
/// let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::OK) })
///     .with(Arc::new(RateLimitMiddleware::new(limiter)));
/// ```
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let client = client_id(&ctx);
        let decision = self.limiter.check(&client, ctx.request().path());

        Box::pin(async move {
            if decision.is_allowed() {
                let mut response = next.run(ctx).await;
                decision.apply_headers(&mut response);
                return response;
            }

            debug!(%client, path = ctx.request().path(), ?decision, "request rejected");
            let mut response = Response::new(StatusCode::TOO_MANY_REQUESTS).json(&json!({
                "error": "Too many requests",
                "retryAfter": decision.retry_after_secs(),
            }));
            decision.apply_headers(&mut response);
            response
        })
    }
}
