//! Request admission: per-client rate limiting with escalating blocks.
//!
//! - [`RateLimiter`] keeps a fixed window per client and [`RouteClass`] in
//!   the shared cache and blocks clients that keep exceeding it.
//! - [`RateLimitMiddleware`] puts the limiter in front of a
//!   [`Pipeline`](crate::middleware::Pipeline) and answers `429` for
//!   rejected requests.

mod limiter;
mod middleware;

use serde::{Deserialize, Serialize};

pub use limiter::{
    LimiterError, LimiterStats, RateDecision, RateLimiter, RateWindow, SECURITY_SEGMENT, Violation,
};
pub use middleware::{RateLimitMiddleware, client_id};

/// Budget class a request path falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteClass {
    Auth,
    Api,
    Public,
    Default,
}

impl RouteClass {
    pub const ALL: [RouteClass; 4] = [Self::Auth, Self::Api, Self::Public, Self::Default];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Public => "public",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
