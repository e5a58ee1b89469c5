//! Middleware pipeline: composable before/after request handler logic.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining chain; call [`Next::run`] to advance.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`Pipeline`]: an ordered stack in front of a terminal handler.
//! - [`LoggerMiddleware`]: request/response logger.
//!
//! The rate limiter ([`RateLimitMiddleware`](crate::security::RateLimitMiddleware))
//! short-circuits; the metrics recorder
//! ([`MetricsMiddleware`](crate::metrics::MetricsMiddleware)) decorates.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Request, Response, StatusCode, context::Context};

/// Boxed future returned by every middleware and handler.
pub type BoxResponse = Pin<Box<dyn Future<Output = Response> + Send>>;

/// A type-erased, reference-counted middleware function.
pub type MiddlewareHandler = Arc<dyn Fn(Context, Next) -> BoxResponse + Send + Sync + 'static>;

/// The application handler at the end of a [`Pipeline`].
pub type Endpoint = Arc<dyn Fn(Context) -> BoxResponse + Send + Sync + 'static>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward
/// the request at most once.
pub struct Next {
    middlewares: Arc<[MiddlewareHandler]>,
    endpoint: Option<Endpoint>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

impl Next {
    /// Creates a cursor at the start of `middlewares`, ending in `endpoint`.
    ///
    /// Without an endpoint an exhausted chain answers `500`.
    pub fn new(middlewares: Vec<MiddlewareHandler>, endpoint: Option<Endpoint>) -> Self {
        Self {
            middlewares: middlewares.into(),
            endpoint,
            index: 0,
        }
    }

    /// Invokes the next middleware, or the endpoint once the chain is
    /// exhausted.
    pub async fn run(mut self, ctx: Context) -> Response {
        if let Some(handler) = self.middlewares.get(self.index).cloned() {
            self.index += 1;
            return handler(ctx, self).await;
        }
        match self.endpoint.take() {
            Some(endpoint) => endpoint(ctx).await,
            None => Response::new(StatusCode::INTERNAL_SERVER_ERROR)
                .body("No response generated by middleware pipeline"),
        }
    }
}

/// The core middleware trait.
///
/// Implementors may pass through (`next.run(ctx).await`), short-circuit by
/// returning a [`Response`] without calling `next`, or decorate the
/// downstream response.
///
/// Implementations must be `Send + Sync` because middleware is shared across
/// Tokio tasks, and must not hold locks across an `.await`.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse;
}

/// An ordered middleware stack in front of an endpoint.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use cadence::context::Context;
/// use cadence::http::{Method, Request, Response, StatusCode};
/// use cadence::middleware::{LoggerMiddleware, Pipeline};
///
/// # tokio_test_block_on(async {
/// let pipeline = Pipeline::new(|_ctx: Context| async { Response::new(StatusCode::OK) })
///     .with(Arc::new(LoggerMiddleware));
///
/// let response = pipeline.handle(Request::new(Method::Get, "/health")).await;
/// assert_eq!(response.status(), StatusCode::OK);
/// # });
/// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
    endpoint: Endpoint,
}

impl Pipeline {
    pub fn new<H, F>(endpoint: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let endpoint: Endpoint =
            Arc::new(move |ctx: Context| -> BoxResponse { Box::pin(endpoint(ctx)) });
        Self {
            middlewares: Vec::new(),
            endpoint,
        }
    }

    /// Appends a middleware. Middleware runs in the order it was added.
    #[must_use]
    pub fn with<M>(self, middleware: Arc<M>) -> Self
    where
        M: Middleware + 'static,
    {
        self.with_handler(from_middleware(middleware))
    }

    #[must_use]
    pub fn with_handler(mut self, handler: MiddlewareHandler) -> Self {
        self.middlewares.push(handler);
        self
    }

    /// Runs `request` through the stack.
    pub async fn handle(&self, request: Request) -> Response {
        self.handle_context(Context::new(request)).await
    }

    /// Runs a prepared context through the stack.
    pub async fn handle_context(&self, ctx: Context) -> Response {
        Next::new(self.middlewares.clone(), Some(self.endpoint.clone()))
            .run(ctx)
            .await
    }
}

/// Logs each request's method, path, status and duration at `info` level.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> BoxResponse {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            tracing::info!(
                %method,
                %path,
                status = response.status().as_u16(),
                elapsed = ?start.elapsed(),
                "request completed"
            );
            response
        })
    }
}
