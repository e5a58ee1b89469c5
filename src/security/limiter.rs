//! Sliding-window rate limiter with escalating blocks.
//!
//! ```text
//!     request ──► blocked? ──yes──► Blocked (429, no window change)
//!                    │no
//!                    ▼
//!              load window from cache (segment "security")
//!              now >= reset_at ? reset count, reset_at = now + window
//!              count += 1
//!                    │
//!         count > max ? ──no──► Allowed (X-RateLimit-* headers)
//!                    │yes
//!                    ▼
//!              log violation ──► Limited (429, Retry-After)
//!              violations in last lookback >= threshold ? block client
//! ```
//!
//! A client moves from counting to blocked once it collects
//! `block_threshold` violations inside `lookback_multiplier × window`, and back
//! once `blocked_until` has passed. Block expiry is checked lazily on the next
//! request.
//!
//! Storage faults never reject a request: the limiter logs them and answers
//! [`RateDecision::Degraded`], which allows.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::RouteClass;
use crate::cache::{Cache, SetOptions};
use crate::clock::SharedClock;
use crate::config::{PrefixRule, RateLimitConfig, RateRule};
use crate::http::Response;

/// Cache segment holding rate windows.
pub const SECURITY_SEGMENT: &str = "security";

/// Internal faults. These are logged and turned into
/// [`RateDecision::Degraded`], never returned to callers.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("stored rate window {key:?} is unreadable: {source}")]
    CorruptWindow {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("rate window could not be encoded: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Per-client counter for one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    /// Epoch milliseconds at which the window restarts.
    pub reset_at: u64,
}

/// A rejected request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub client_id: String,
    pub path: String,
    pub timestamp: u64,
}

/// Outcome of [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_at: u64,
    },
    /// Over budget for the current window.
    Limited {
        limit: u32,
        reset_at: u64,
        retry_after: Duration,
        /// This violation blocked the client.
        escalated: bool,
    },
    /// The client is serving a block.
    Blocked { until: u64, retry_after: Duration },
    /// An internal fault occurred; the request is let through.
    Degraded,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. } | Self::Degraded)
    }

    /// Whole seconds until the client may retry, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::Limited { retry_after, .. } | Self::Blocked { retry_after, .. } => {
                Some(ceil_secs(retry_after.as_millis() as u64))
            }
            _ => None,
        }
    }

    /// Writes `X-RateLimit-*` and `Retry-After` headers for this decision.
    /// `X-RateLimit-Reset` is in epoch seconds.
    pub fn apply_headers(&self, response: &mut Response) {
        match *self {
            Self::Allowed {
                limit,
                remaining,
                reset_at,
            } => {
                response.set_header("X-RateLimit-Limit", limit.to_string());
                response.set_header("X-RateLimit-Remaining", remaining.to_string());
                response.set_header("X-RateLimit-Reset", ceil_secs(reset_at).to_string());
            }
            Self::Limited {
                limit, reset_at, ..
            } => {
                response.set_header("X-RateLimit-Limit", limit.to_string());
                response.set_header("X-RateLimit-Remaining", "0");
                response.set_header("X-RateLimit-Reset", ceil_secs(reset_at).to_string());
            }
            Self::Blocked { .. } | Self::Degraded => {}
        }
        if let Some(secs) = self.retry_after_secs() {
            response.set_header("Retry-After", secs.to_string());
        }
    }
}

fn ceil_secs(ms: u64) -> u64 {
    ms.div_ceil(1000)
}

/// Counters since start-up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub checked: u64,
    pub allowed: u64,
    pub limited: u64,
    pub blocked: u64,
    pub degraded: u64,
    pub active_blocks: usize,
    pub violations_logged: usize,
}

#[derive(Default)]
struct Escalation {
    violations: VecDeque<Violation>,
    blocks: HashMap<String, u64>,
    stats: LimiterStats,
}

impl Escalation {
    /// Returns the block deadline if `client_id` is blocked at `now`,
    /// dropping an expired block on the way.
    fn blocked_until(&mut self, client_id: &str, now: u64) -> Option<u64> {
        let until = *self.blocks.get(client_id)?;
        if now < until {
            return Some(until);
        }
        self.blocks.remove(client_id);
        debug!(client = client_id, "block expired");
        None
    }
}

/// Per-client sliding-window limiter keyed by route class.
pub struct RateLimiter {
    cache: Arc<Cache>,
    config: RateLimitConfig,
    prefixes: Vec<PrefixRule>,
    clock: SharedClock,
    // Held across the cache read-modify-write so each check is atomic.
    state: Mutex<Escalation>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, cache: Arc<Cache>, clock: SharedClock) -> Self {
        let mut prefixes = config.prefixes.clone();
        prefixes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            cache,
            config,
            prefixes,
            clock,
            state: Mutex::new(Escalation::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Escalation> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route class of `path`: the longest configured prefix matching on a
    /// segment boundary, else [`RouteClass::Default`].
    pub fn classify(&self, path: &str) -> RouteClass {
        self.prefixes
            .iter()
            .find(|rule| {
                path.strip_prefix(rule.prefix.as_str()).is_some_and(|rest| {
                    rest.is_empty() || rest.starts_with('/') || rule.prefix.ends_with('/')
                })
            })
            .map_or(RouteClass::Default, |rule| rule.class)
    }

    /// Configured limit for a route class.
    pub fn rule(&self, class: RouteClass) -> RateRule {
        *self.config.rules.get(class)
    }

    /// Counts a request from `client_id` to `path` and decides whether it may
    /// proceed.
    pub fn check(&self, client_id: &str, path: &str) -> RateDecision {
        let class = self.classify(path);
        let rule = self.rule(class);
        let now = self.clock.now_ms();
        let mut state = self.lock();
        state.stats.checked += 1;

        if let Some(until) = state.blocked_until(client_id, now) {
            state.stats.blocked += 1;
            return RateDecision::Blocked {
                until,
                retry_after: Duration::from_millis(until - now),
            };
        }

        let window = match self.count(client_id, class, rule, now) {
            Ok(window) => window,
            Err(e) => {
                warn!(client = client_id, %path, error = %e, "rate limiter fault; failing open");
                state.stats.degraded += 1;
                return RateDecision::Degraded;
            }
        };

        if window.count <= rule.max {
            state.stats.allowed += 1;
            return RateDecision::Allowed {
                limit: rule.max,
                remaining: rule.max - window.count,
                reset_at: window.reset_at,
            };
        }

        state.stats.limited += 1;
        let escalated = self.record_violation(&mut state, client_id, path, rule, now);
        RateDecision::Limited {
            limit: rule.max,
            reset_at: window.reset_at,
            retry_after: Duration::from_millis(window.reset_at.saturating_sub(now)),
            escalated,
        }
    }

    fn window_key(client_id: &str, class: RouteClass) -> String {
        format!("rate:{}:{client_id}", class.as_str())
    }

    fn count(
        &self,
        client_id: &str,
        class: RouteClass,
        rule: RateRule,
        now: u64,
    ) -> Result<RateWindow, LimiterError> {
        let key = Self::window_key(client_id, class);
        let stored = match self.cache.get(&key, SECURITY_SEGMENT) {
            Some(value) => match serde_json::from_value::<RateWindow>(value) {
                Ok(window) => Some(window),
                Err(source) => {
                    self.cache.delete(&key, SECURITY_SEGMENT);
                    return Err(LimiterError::CorruptWindow { key, source });
                }
            },
            None => None,
        };

        let mut window = match stored {
            Some(window) if now < window.reset_at => window,
            _ => {
                debug!(client = client_id, class = class.as_str(), "starting rate window");
                RateWindow {
                    count: 0,
                    reset_at: now.saturating_add(rule.window_ms),
                }
            }
        };
        window.count = window.count.saturating_add(1);

        let value = serde_json::to_value(window).map_err(LimiterError::Encode)?;
        let ttl = Duration::from_millis(window.reset_at - now);
        self.cache.set(&key, value, SetOptions::in_segment(SECURITY_SEGMENT).ttl(ttl));
        Ok(window)
    }

    // Returns true when this violation blocked the client.
    fn record_violation(
        &self,
        state: &mut Escalation,
        client_id: &str,
        path: &str,
        rule: RateRule,
        now: u64,
    ) -> bool {
        state.violations.push_back(Violation {
            client_id: client_id.to_owned(),
            path: path.to_owned(),
            timestamp: now,
        });
        while state.violations.len() > self.config.violation_log {
            state.violations.pop_front();
        }

        let lookback = rule.window_ms.saturating_mul(u64::from(self.config.lookback_multiplier));
        let since = now.saturating_sub(lookback);
        let recent = state
            .violations
            .iter()
            .filter(|v| v.client_id == client_id && v.timestamp >= since)
            .count();
        if recent < self.config.block_threshold {
            return false;
        }

        let until = now.saturating_add(self.config.block_duration_ms);
        state.blocks.insert(client_id.to_owned(), until);
        info!(client = client_id, violations = recent, until, "client blocked");
        true
    }

    /// Returns `true` while an escalation block on `client_id` is active.
    pub fn is_blocked(&self, client_id: &str) -> bool {
        let now = self.clock.now_ms();
        self.lock().blocked_until(client_id, now).is_some()
    }

    /// Lifts a block early. Returns `false` if the client was not blocked.
    pub fn unblock(&self, client_id: &str) -> bool {
        self.lock().blocks.remove(client_id).is_some()
    }

    /// Forgets everything about a client: windows, violations and block.
    pub fn reset_client(&self, client_id: &str) {
        let mut state = self.lock();
        state.blocks.remove(client_id);
        state.violations.retain(|v| v.client_id != client_id);
        for class in RouteClass::ALL {
            self.cache.delete(&Self::window_key(client_id, class), SECURITY_SEGMENT);
        }
    }

    /// Logged violations of `client_id`, oldest first.
    pub fn violations_for(&self, client_id: &str) -> Vec<Violation> {
        self.lock()
            .violations
            .iter()
            .filter(|v| v.client_id == client_id)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> LimiterStats {
        let now = self.clock.now_ms();
        let state = self.lock();
        LimiterStats {
            active_blocks: state.blocks.values().filter(|&&until| now < until).count(),
            violations_logged: state.violations.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{CacheConfig, RouteRules};
    use crate::http::StatusCode;
    use serde_json::json;

    const T0: u64 = 1_700_000_000_000;
    const MINUTE: Duration = Duration::from_secs(60);

    struct Harness {
        limiter: RateLimiter,
        cache: Arc<Cache>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let rule = RateRule::new(3, MINUTE);
        let config = RateLimitConfig {
            rules: RouteRules {
                auth: RateRule::new(1, MINUTE),
                api: rule,
                public: rule,
                default: rule,
            },
            block_duration_ms: 10 * 60 * 1000,
            ..RateLimitConfig::default()
        };
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(Cache::new(&CacheConfig::default(), clock.clone()));
        Harness {
            limiter: RateLimiter::new(config, cache.clone(), clock.clone()),
            cache,
            clock,
        }
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn fourth_request_in_window_is_rejected() {
        let h = harness();
        for remaining in [2, 1, 0] {
            assert_eq!(
                h.limiter.check("ip:1", "/api/recipes"),
                RateDecision::Allowed {
                    limit: 3,
                    remaining,
                    reset_at: T0 + 60_000
                }
            );
        }

        h.clock.advance(secs(10));
        let decision = h.limiter.check("ip:1", "/api/recipes");
        assert!(matches!(
            decision,
            RateDecision::Limited { escalated: false, .. }
        ));
        assert_eq!(decision.retry_after_secs(), Some(50));

        let mut response = Response::new(StatusCode::TOO_MANY_REQUESTS);
        decision.apply_headers(&mut response);
        assert_eq!(response.headers().get("retry-after"), Some("50"));
        assert_eq!(response.headers().get("x-ratelimit-remaining"), Some("0"));
    }

    #[test]
    fn window_restarts_at_boundary() {
        let h = harness();
        for _ in 0..4 {
            h.limiter.check("ip:1", "/api/recipes");
        }
        h.clock.set(T0 + 60_000);
        assert_eq!(
            h.limiter.check("ip:1", "/api/recipes"),
            RateDecision::Allowed {
                limit: 3,
                remaining: 2,
                reset_at: T0 + 120_000
            }
        );
    }

    #[test]
    fn allowed_headers_report_budget() {
        let h = harness();
        let decision = h.limiter.check("ip:1", "/");
        let mut response = Response::default();
        decision.apply_headers(&mut response);
        assert_eq!(response.headers().get("x-ratelimit-limit"), Some("3"));
        assert_eq!(response.headers().get("x-ratelimit-remaining"), Some("2"));
        assert_eq!(
            response.headers().get("x-ratelimit-reset"),
            Some(((T0 + 60_000) / 1000).to_string().as_str())
        );
        assert!(!response.headers().contains("retry-after"));
    }

    #[test]
    fn five_violations_block_until_duration_elapses() {
        let h = harness();
        for _ in 0..3 {
            assert!(h.limiter.check("ip:9", "/api/rides").is_allowed());
        }
        let mut decisions = Vec::new();
        for _ in 0..5 {
            decisions.push(h.limiter.check("ip:9", "/api/rides"));
        }
        assert!(decisions[..4]
            .iter()
            .all(|d| matches!(d, RateDecision::Limited { escalated: false, .. })));
        assert!(matches!(
            decisions[4],
            RateDecision::Limited { escalated: true, .. }
        ));

        // A fresh window would allow, but the block wins.
        h.clock.advance(secs(61));
        let blocked = h.limiter.check("ip:9", "/api/rides");
        assert!(matches!(blocked, RateDecision::Blocked { .. }));
        assert_eq!(blocked.retry_after_secs(), Some(10 * 60 - 61));
        assert!(h.limiter.is_blocked("ip:9"));
        assert!(h.limiter.check("ip:other", "/api/rides").is_allowed());

        h.clock.set(T0 + 10 * 60 * 1000);
        assert!(h.limiter.check("ip:9", "/api/rides").is_allowed());
        assert!(!h.limiter.is_blocked("ip:9"));
    }

    #[test]
    fn violations_outside_lookback_do_not_block() {
        let h = harness();
        for _ in 0..5 {
            for _ in 0..4 {
                h.limiter.check("ip:slow", "/api/rides");
            }
            h.clock.advance(secs(100));
        }
        assert_eq!(h.limiter.violations_for("ip:slow").len(), 5);
        assert!(!h.limiter.is_blocked("ip:slow"));
        assert!(h.limiter.check("ip:slow", "/api/rides").is_allowed());
    }

    #[test]
    fn blocked_requests_do_not_touch_the_window() {
        let h = harness();
        for _ in 0..8 {
            h.limiter.check("ip:9", "/api/rides");
        }
        let key = RateLimiter::window_key("ip:9", RouteClass::Api);
        let before = h.cache.get(&key, SECURITY_SEGMENT);
        h.limiter.check("ip:9", "/api/rides");
        assert_eq!(h.cache.get(&key, SECURITY_SEGMENT), before);
        assert_eq!(before.unwrap()["count"], json!(8));
    }

    #[test]
    fn classify_uses_longest_prefix_on_segment_boundary() {
        let h = harness();
        assert_eq!(h.limiter.classify("/api/auth/login"), RouteClass::Auth);
        assert_eq!(h.limiter.classify("/auth"), RouteClass::Auth);
        assert_eq!(h.limiter.classify("/api/recipes/12"), RouteClass::Api);
        assert_eq!(h.limiter.classify("/public/challenges"), RouteClass::Public);
        assert_eq!(h.limiter.classify("/apiary"), RouteClass::Default);
        assert_eq!(h.limiter.classify("/"), RouteClass::Default);
    }

    #[test]
    fn route_classes_count_separately() {
        let h = harness();
        assert!(h.limiter.check("ip:1", "/api/auth/login").is_allowed());
        assert!(!h.limiter.check("ip:1", "/api/auth/login").is_allowed());
        assert!(h.limiter.check("ip:1", "/api/recipes").is_allowed());
    }

    #[test]
    fn corrupt_window_fails_open_and_recovers() {
        let h = harness();
        let key = RateLimiter::window_key("ip:1", RouteClass::Default);
        h.cache.set(&key, json!("garbage"), SetOptions::in_segment(SECURITY_SEGMENT));

        assert_eq!(h.limiter.check("ip:1", "/"), RateDecision::Degraded);
        assert!(RateDecision::Degraded.is_allowed());
        assert_eq!(h.limiter.stats().degraded, 1);

        assert!(matches!(
            h.limiter.check("ip:1", "/"),
            RateDecision::Allowed { remaining: 2, .. }
        ));
    }

    #[test]
    fn windows_live_in_security_segment_and_expire() {
        let h = harness();
        h.limiter.check("ip:1", "/");
        assert_eq!(h.cache.segment_len(SECURITY_SEGMENT), 1);
        h.clock.advance(secs(60));
        assert_eq!(h.cache.prune(), 1);
    }

    #[test]
    fn unblock_and_reset_client() {
        let h = harness();
        for _ in 0..8 {
            h.limiter.check("ip:9", "/api/rides");
        }
        assert!(h.limiter.is_blocked("ip:9"));
        assert!(h.limiter.unblock("ip:9"));
        assert!(!h.limiter.unblock("ip:9"));
        assert!(!h.limiter.check("ip:9", "/api/rides").is_allowed(), "window still exhausted");

        h.limiter.reset_client("ip:9");
        assert!(h.limiter.violations_for("ip:9").is_empty());
        assert!(h.limiter.check("ip:9", "/api/rides").is_allowed());
    }

    #[test]
    fn stats_track_outcomes() {
        let h = harness();
        for _ in 0..8 {
            h.limiter.check("ip:9", "/api/rides");
        }
        h.limiter.check("ip:9", "/api/rides");
        let stats = h.limiter.stats();
        assert_eq!(stats.checked, 9);
        assert_eq!(stats.allowed, 3);
        assert_eq!(stats.limited, 5);
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.active_blocks, 1);
        assert_eq!(stats.violations_logged, 5);
    }

    #[test]
    fn violation_log_is_bounded() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(Cache::new(&CacheConfig::default(), clock.clone()));
        let config = RateLimitConfig {
            rules: RouteRules {
                default: RateRule::new(0, MINUTE),
                ..RouteRules::default()
            },
            violation_log: 3,
            block_threshold: 100,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, cache, clock);
        for i in 0..10 {
            limiter.check(&format!("ip:{i}"), "/");
        }
        assert_eq!(limiter.stats().violations_logged, 3);
        assert_eq!(limiter.violations_for("ip:9").len(), 1);
        assert!(limiter.violations_for("ip:0").is_empty());
    }

    #[test]
    fn extreme_durations_saturate() {
        let clock = Arc::new(ManualClock::new(T0));
        let cache = Arc::new(Cache::new(&CacheConfig::default(), clock.clone()));
        let config = RateLimitConfig {
            rules: RouteRules {
                default: RateRule::new(0, Duration::from_millis(u64::MAX)),
                ..RouteRules::default()
            },
            lookback_multiplier: u32::MAX,
            block_threshold: 1,
            block_duration_ms: u64::MAX,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config, cache, clock);

        assert!(matches!(
            limiter.check("ip:1", "/"),
            RateDecision::Limited {
                reset_at: u64::MAX,
                escalated: true,
                ..
            }
        ));
        assert!(matches!(
            limiter.check("ip:1", "/"),
            RateDecision::Blocked { until: u64::MAX, .. }
        ));
    }
}
