//! Static configuration for the cache, rate limiter and metrics aggregator.
//!
//! Configuration is read once at process start. It can come from
//! [`Config::default`], a JSON document ([`Config::from_json_str`]) or
//! `CADENCE_*` environment variables layered over the defaults
//! ([`Config::from_env`]). Durations are expressed in milliseconds so the JSON
//! form stays flat:
//!
//! ```json
//! {
//!   "cache": { "max_size": 2000, "segment_limits": { "weather": 50 } },
//!   "rate_limit": { "rules": { "auth": { "max": 5, "window_ms": 60000 } } },
//!   "metrics": { "slow_request_threshold_ms": 500 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::security::RouteClass;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be within (0, 1], got {value}")]
    Ratio { field: &'static str, value: f64 },

    #[error("route prefix {prefix:?} must start with '/'")]
    Prefix { prefix: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Parses and validates a JSON configuration document. Missing fields take
    /// their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed input, or a validation
    /// error from [`validate`](Self::validate).
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from defaults overlaid with `CADENCE_*`
    /// environment variables.
    ///
    /// Unparsable values are logged and ignored rather than aborting start-up.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads variables through
    /// `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        overlay(&lookup, "CADENCE_CACHE_MAX_SIZE", &mut config.cache.max_size);
        overlay(&lookup, "CADENCE_CACHE_DEFAULT_TTL_MS", &mut config.cache.default_ttl_ms);

        let rl = &mut config.rate_limit;
        overlay(&lookup, "CADENCE_RATE_AUTH_MAX", &mut rl.rules.auth.max);
        overlay(&lookup, "CADENCE_RATE_API_MAX", &mut rl.rules.api.max);
        overlay(&lookup, "CADENCE_RATE_PUBLIC_MAX", &mut rl.rules.public.max);
        overlay(&lookup, "CADENCE_RATE_DEFAULT_MAX", &mut rl.rules.default.max);
        overlay(&lookup, "CADENCE_RATE_BLOCK_THRESHOLD", &mut rl.block_threshold);
        overlay(&lookup, "CADENCE_RATE_BLOCK_DURATION_MS", &mut rl.block_duration_ms);
        if let Some(window_ms) = parse_var::<u64, _>(&lookup, "CADENCE_RATE_WINDOW_MS") {
            for class in RouteClass::ALL {
                rl.rules.get_mut(class).window_ms = window_ms;
            }
        }

        let m = &mut config.metrics;
        overlay(&lookup, "CADENCE_METRICS_SAMPLE_INTERVAL_MS", &mut m.sample_interval_ms);
        overlay(&lookup, "CADENCE_METRICS_SLOW_REQUEST_MS", &mut m.slow_request_threshold_ms);
        overlay(&lookup, "CADENCE_METRICS_DETAILED", &mut m.detailed);

        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that cannot be degraded into a working component.
    ///
    /// Segment capacities of zero are accepted; the cache treats them as
    /// evict-on-every-insert.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        for class in RouteClass::ALL {
            if rl.rules.get(class).window_ms == 0 {
                return Err(ConfigError::Zero {
                    field: "rate_limit.rules.*.window_ms",
                });
            }
        }
        for prefix in &rl.prefixes {
            if !prefix.prefix.starts_with('/') {
                return Err(ConfigError::Prefix {
                    prefix: prefix.prefix.clone(),
                });
            }
        }
        nonzero("rate_limit.lookback_multiplier", rl.lookback_multiplier as u64)?;
        nonzero("rate_limit.block_threshold", rl.block_threshold as u64)?;
        nonzero("rate_limit.violation_log", rl.violation_log as u64)?;

        let m = &self.metrics;
        nonzero("metrics.sample_interval_ms", m.sample_interval_ms)?;
        nonzero("metrics.latency_samples", m.latency_samples as u64)?;
        nonzero("metrics.system_history", m.system_history as u64)?;
        if !(m.usage_warning_ratio > 0.0 && m.usage_warning_ratio <= 1.0) {
            return Err(ConfigError::Ratio {
                field: "metrics.usage_warning_ratio",
                value: m.usage_warning_ratio,
            });
        }
        Ok(())
    }
}

/// Cache sizing and expiry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries across all segments.
    pub max_size: usize,
    /// TTL applied when a `set` does not specify one. `0` means never expire.
    pub default_ttl_ms: u64,
    /// Optional per-segment entry limits.
    pub segment_limits: BTreeMap<String, usize>,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::from_millis(self.default_ttl_ms))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let segment_limits = [("recipes", 500), ("strava", 250), ("weather", 100)]
            .into_iter()
            .map(|(name, limit)| (name.to_string(), limit))
            .collect();
        Self {
            max_size: 5_000,
            default_ttl_ms: 5 * 60 * 1000,
            segment_limits,
        }
    }
}

/// Request budget for one route class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RateRule {
    pub max: u32,
    pub window_ms: u64,
}

impl RateRule {
    pub const fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window_ms: window.as_millis() as u64,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// One [`RateRule`] per [`RouteClass`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteRules {
    pub auth: RateRule,
    pub api: RateRule,
    pub public: RateRule,
    pub default: RateRule,
}

impl RouteRules {
    pub fn get(&self, class: RouteClass) -> &RateRule {
        match class {
            RouteClass::Auth => &self.auth,
            RouteClass::Api => &self.api,
            RouteClass::Public => &self.public,
            RouteClass::Default => &self.default,
        }
    }

    pub fn get_mut(&mut self, class: RouteClass) -> &mut RateRule {
        match class {
            RouteClass::Auth => &mut self.auth,
            RouteClass::Api => &mut self.api,
            RouteClass::Public => &mut self.public,
            RouteClass::Default => &mut self.default,
        }
    }
}

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);

impl Default for RouteRules {
    fn default() -> Self {
        Self {
            auth: RateRule::new(10, FIFTEEN_MINUTES),
            api: RateRule::new(100, FIFTEEN_MINUTES),
            public: RateRule::new(300, FIFTEEN_MINUTES),
            default: RateRule::new(200, FIFTEEN_MINUTES),
        }
    }
}

/// Maps a path prefix to a route class.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrefixRule {
    pub prefix: String,
    pub class: RouteClass,
}

impl PrefixRule {
    pub fn new(prefix: impl Into<String>, class: RouteClass) -> Self {
        Self {
            prefix: prefix.into(),
            class,
        }
    }
}

/// Rate limiter budgets and escalation policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub rules: RouteRules,
    /// Path prefixes, matched longest-first. Unmatched paths use
    /// [`RouteClass::Default`].
    pub prefixes: Vec<PrefixRule>,
    /// Violations are counted over `lookback_multiplier × window`.
    pub lookback_multiplier: u32,
    /// Violations within the lookback that trigger a block.
    pub block_threshold: usize,
    pub block_duration_ms: u64,
    /// Capacity of the violation log.
    pub violation_log: usize,
}

impl RateLimitConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rules: RouteRules::default(),
            prefixes: vec![
                PrefixRule::new("/api/auth", RouteClass::Auth),
                PrefixRule::new("/auth", RouteClass::Auth),
                PrefixRule::new("/api/public", RouteClass::Public),
                PrefixRule::new("/public", RouteClass::Public),
                PrefixRule::new("/api", RouteClass::Api),
            ],
            lookback_multiplier: 5,
            block_threshold: 5,
            block_duration_ms: 60 * 60 * 1000,
            violation_log: 1_000,
        }
    }
}

/// Metrics aggregation and system sampling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub sample_interval_ms: u64,
    pub slow_request_threshold_ms: u64,
    /// Size of the latency ring buffer.
    pub latency_samples: usize,
    pub slow_request_log: usize,
    pub error_log: usize,
    /// Number of system samples retained.
    pub system_history: usize,
    /// Memory or CPU usage above this ratio logs a warning.
    pub usage_warning_ratio: f64,
    /// Always include the detailed breakdown in snapshots.
    pub detailed: bool,
    /// Slow requests and errors included in a detailed snapshot.
    pub detail_entries: usize,
}

impl MetricsConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn slow_request_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_request_threshold_ms)
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 30_000,
            slow_request_threshold_ms: 1_000,
            latency_samples: 1_000,
            slow_request_log: 100,
            error_log: 100,
            system_history: 60,
            usage_warning_ratio: 0.9,
            detailed: false,
            detail_entries: 20,
        }
    }
}

fn nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => {
            debug!(key, value = %raw, "configuration override");
            Some(value)
        }
        Err(e) => {
            warn!(key, value = %raw, error = %e, "ignoring invalid configuration value");
            None
        }
    }
}

fn overlay<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = parse_var(lookup, key) {
        *target = value;
    }
}
