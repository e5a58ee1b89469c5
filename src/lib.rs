//! # cadence
//!
//! In-process resource control and observability for an async HTTP API:
//!
//! - [`cache`]: segmented key/value cache with per-entry TTL and two-tier
//!   (segment, then global) LRU eviction.
//! - [`security`]: per-client rate limiter keyed by route class, with an
//!   escalating block list. Windows live in the cache.
//! - [`metrics`]: request, latency, error, db and host metrics with bounded
//!   histories. Snapshots include cache statistics.
//!
//! The host owns the socket and the router; it feeds requests through a
//! [`middleware::Pipeline`] built by [`Services::pipeline`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cadence::{Config, Services};
//! use cadence::context::Context;
//! use cadence::http::{Method, Request, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = Services::from_config(Config::from_env()?)?;
//!     services.start();
//!
//!     let pipeline = services.pipeline(|_ctx: Context| async {
//!         Response::new(StatusCode::OK).body("pong")
//!     });
//!     let response = pipeline.handle(Request::new(Method::Get, "/api/ping")).await;
//!     println!("{}", response.status());
//!
//!     let snapshot = services.metrics.get_metrics(false);
//!     println!("{}", serde_json::to_string_pretty(&snapshot)?);
//!     Ok(())
//! }
//! ```

pub mod background;
pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod http;
pub mod metrics;
pub mod middleware;
pub mod security;

pub use cache::{Cache, SetOptions};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use metrics::MetricsAggregator;
pub use security::{RateDecision, RateLimiter};

use std::sync::Arc;

use context::Context;
use middleware::{LoggerMiddleware, Pipeline};
use security::RateLimitMiddleware;

/// Owns the cache, rate limiter and metrics aggregator for one process.
///
/// The limiter stores its windows in [`cache`](Self::cache) and the
/// aggregator reports its statistics.
#[derive(Clone)]
pub struct Services {
    pub cache: Arc<Cache>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsAggregator>,
}

impl Services {
    /// Validates `config` and builds the services on the system clock.
    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: Config, clock: SharedClock) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Arc::new(Cache::new(&config.cache, clock.clone()));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit,
            cache.clone(),
            clock.clone(),
        ));
        let metrics =
            Arc::new(MetricsAggregator::new(config.metrics, clock).with_cache(cache.clone()));
        Ok(Self {
            cache,
            limiter,
            metrics,
        })
    }

    /// Starts background sampling. Returns `false` if already started or
    /// called outside a Tokio runtime.
    pub fn start(&self) -> bool {
        self.metrics.start()
    }

    pub fn stop(&self) -> bool {
        self.metrics.stop()
    }

    /// Wraps `endpoint` as logger → metrics → rate limiter → endpoint, so
    /// rejected requests are still logged and counted.
    pub fn pipeline<H, F>(&self, endpoint: H) -> Pipeline
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        Pipeline::new(endpoint)
            .with(Arc::new(LoggerMiddleware))
            .with(Arc::new(self.metrics.middleware()))
            .with(Arc::new(RateLimitMiddleware::new(self.limiter.clone())))
    }
}
