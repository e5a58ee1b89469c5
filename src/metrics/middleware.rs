use std::sync::Arc;

use super::{ErrorMeta, MetricsAggregator, RequestMeta};
use crate::{
    context::Context,
    middleware::{BoxResponse, Middleware, Next},
};

/// Collapses id-like path segments (all digits, or 24 hex digits) into `:id`
/// so per-endpoint counters stay bounded.
///
/// ```
/// use cadence::metrics::normalize_endpoint;
///
/// assert_eq!(normalize_endpoint("/api/recipes/42"), "/api/recipes/:id");
/// assert_eq!(
///     normalize_endpoint("/api/users/64b7f0c2e4a1b2c3d4e5f6a7/rides"),
///     "/api/users/:id/rides"
/// );
/// ```
pub fn normalize_endpoint(path: &str) -> String {
    path.split('/')
        .map(|segment| if is_id(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_id(segment: &str) -> bool {
    let numeric = !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit());
    let object_id = segment.len() == 24 && segment.bytes().all(|b| b.is_ascii_hexdigit());
    numeric || object_id
}

/// Records every response that passes through it. Server errors (`5xx`)
/// are also recorded as errors.
pub struct MetricsMiddleware {
    metrics: Arc<MetricsAggregator>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<MetricsAggregator>) -> Self {
        Self { metrics }
    }
}

impl Middleware for MetricsMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        let metrics = Arc::clone(&self.metrics);
        let started_at = metrics.now_ms();
        let method = ctx.request().method().to_string();
        let endpoint = normalize_endpoint(ctx.request().path());
        let user = ctx.user().map(str::to_owned);

        Box::pin(async move {
            let response = next.run(ctx).await;
            let status = response.status();

            let meta = RequestMeta {
                method,
                endpoint,
                status: status.as_u16(),
                user,
            };
            metrics.record_request(&meta, started_at);
            if status.is_server_error() {
                let error = ErrorMeta::status(status.as_u16(), status.canonical_reason());
                metrics.record_error(error.at(meta.endpoint));
            }
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MetricsConfig;
    use crate::context::AuthenticatedUser;
    use crate::middleware::Pipeline;
    use crate::{Method, Request, Response, StatusCode};
    use std::time::Duration;

    #[test]
    fn normalizes_ids_only() {
        assert_eq!(normalize_endpoint("/"), "/");
        assert_eq!(normalize_endpoint("/api/recipes"), "/api/recipes");
        assert_eq!(normalize_endpoint("/api/rides/7/segments/12"), "/api/rides/:id/segments/:id");
        assert_eq!(normalize_endpoint("/api/v2/recipes"), "/api/v2/recipes");
        assert_eq!(normalize_endpoint("/api/deadbeef"), "/api/deadbeef");
    }

    #[tokio::test]
    async fn records_status_latency_and_user() {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let metrics = Arc::new(MetricsAggregator::new(MetricsConfig::default(), clock.clone()));

        let slow_clock = clock.clone();
        let pipeline = Pipeline::new(move |ctx: Context| {
            slow_clock.advance(Duration::from_millis(1_200));
            let status = if ctx.request().path().ends_with("/fail") {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };
            async move { Response::new(status) }
        })
        .with(Arc::new(metrics.middleware()));

        let mut ctx = Context::new(Request::new(Method::Get, "/api/rides/17"));
        ctx.extensions_mut().insert(AuthenticatedUser("auth0|rider".into()));
        pipeline.handle_context(ctx).await;
        pipeline.handle(Request::new(Method::Post, "/api/weather/fail")).await;

        let snap = metrics.get_metrics(true);
        assert_eq!(snap.requests.total, 2);
        assert_eq!(snap.requests.errors, 1);
        assert_eq!(snap.errors.by_type["HTTP_502"], 1);

        let details = snap.details.unwrap();
        assert_eq!(details.endpoints["/api/rides/:id"].count, 1);
        assert_eq!(details.slow_requests.len(), 2);
        assert_eq!(details.slow_requests[0].user.as_deref(), Some("auth0|rider"));
        assert_eq!(details.recent_errors[0].endpoint.as_deref(), Some("/api/weather/fail"));
    }
}
