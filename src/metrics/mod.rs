//! Request, latency, error and host metrics.
//!
//! ```text
//!   MetricsMiddleware ──► record_request ──► counters, latency ring, slow log
//!   host error paths  ──► record_error   ──► per-type counters, error log
//!   data access       ──► record_query   ──► db counters
//!   Periodic sampler  ──► sample_now     ──► system history (kept on reset)
//!
//!   get_metrics(detailed) ──► MetricsSnapshot (+ cache stats when attached)
//! ```
//!
//! Every recording path is infallible, so observing a request can never fail
//! it. Percentiles and min/avg/max are computed from the latency ring when a
//! snapshot is taken.

mod latency;
mod middleware;
mod system;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::background::Periodic;
use crate::cache::{Cache, CacheStats};
use crate::clock::SharedClock;
use crate::config::MetricsConfig;

use latency::LatencyRing;
pub use latency::LatencySummary;
pub use middleware::{MetricsMiddleware, normalize_endpoint};
pub use system::{
    CpuTimes, CpuUsage, MemoryReading, MemoryUsage, ProbeError, ProcProbe, SystemProbe,
    SystemSample,
};

/// What the aggregator needs to know about a finished request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub method: String,
    pub endpoint: String,
    pub status: u16,
    pub user: Option<String>,
}

impl RequestMeta {
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>, status: u16) -> Self {
        Self {
            method: method.into(),
            endpoint: endpoint.into(),
            status,
            user: None,
        }
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An HTTP error status, counted as `HTTP_<code>`.
    Status(u16),
    /// A named failure, counted under its name.
    Exception(String),
}

impl ErrorKind {
    pub fn label(&self) -> String {
        match self {
            Self::Status(code) => format!("HTTP_{code}"),
            Self::Exception(name) => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMeta {
    pub kind: ErrorKind,
    pub message: String,
    pub endpoint: Option<String>,
}

impl ErrorMeta {
    pub fn status(code: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Status(code),
            message: message.into(),
            endpoint: None,
        }
    }

    pub fn exception(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Exception(name.into()),
            message: message.into(),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn at(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlowRequest {
    pub timestamp: u64,
    pub method: String,
    pub endpoint: String,
    pub user: Option<String>,
    pub latency_ms: u64,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EndpointStats {
    pub count: u64,
    pub errors: u64,
    pub total_time_ms: u64,
    pub avg_time_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestSummary {
    pub total: u64,
    pub success: u64,
    pub errors: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceSummary {
    #[serde(flatten)]
    pub latency: LatencySummary,
    pub slow_requests: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorSummary {
    pub total: u64,
    pub by_type: BTreeMap<String, u64>,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemSummary {
    pub latest: Option<SystemSample>,
    pub history: Vec<SystemSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DbSummary {
    pub queries: u64,
    pub errors: u64,
    pub avg_time_ms: f64,
}

/// Raw breakdowns included in detailed snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsDetails {
    pub endpoints: BTreeMap<String, EndpointStats>,
    pub methods: BTreeMap<String, u64>,
    pub statuses: BTreeMap<u16, u64>,
    pub slow_requests: Vec<SlowRequest>,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Result of [`MetricsAggregator::get_metrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub uptime_ms: u64,
    pub requests: RequestSummary,
    pub performance: PerformanceSummary,
    pub errors: ErrorSummary,
    pub system: SystemSummary,
    pub cache: Option<CacheStats>,
    pub db: DbSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<MetricsDetails>,
}

#[derive(Default)]
struct DbCounters {
    queries: u64,
    errors: u64,
    total_time_ms: u64,
}

#[derive(Default)]
struct SystemState {
    history: VecDeque<SystemSample>,
    last_cpu: Option<CpuTimes>,
}

struct State {
    total: u64,
    success: u64,
    failed: u64,
    endpoints: BTreeMap<String, EndpointStats>,
    methods: BTreeMap<String, u64>,
    statuses: BTreeMap<u16, u64>,
    latencies: LatencyRing,
    slow: VecDeque<SlowRequest>,
    error_total: u64,
    error_types: BTreeMap<String, u64>,
    recent_errors: VecDeque<ErrorRecord>,
    db: DbCounters,
    system: SystemState,
}

impl State {
    fn new(config: &MetricsConfig, system: SystemState) -> Self {
        Self {
            total: 0,
            success: 0,
            failed: 0,
            endpoints: BTreeMap::new(),
            methods: BTreeMap::new(),
            statuses: BTreeMap::new(),
            latencies: LatencyRing::new(config.latency_samples),
            slow: VecDeque::new(),
            error_total: 0,
            error_types: BTreeMap::new(),
            recent_errors: VecDeque::new(),
            db: DbCounters::default(),
            system,
        }
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(item);
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 { 0.0 } else { part as f64 / whole as f64 }
}

fn last_n<T: Clone>(log: &VecDeque<T>, n: usize) -> Vec<T> {
    log.iter().skip(log.len().saturating_sub(n)).cloned().collect()
}

/// Aggregates request, error, db and host metrics.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use cadence::clock::SystemClock;
/// use cadence::config::MetricsConfig;
/// use cadence::metrics::{MetricsAggregator, RequestMeta};
///
/// let metrics = MetricsAggregator::new(MetricsConfig::default(), SystemClock::shared());
/// let meta = RequestMeta::new("GET", "/api/recipes", 200);
/// metrics.record_latency(&meta, Duration::from_millis(12));
///
/// let snapshot = metrics.get_metrics(false);
/// assert_eq!(snapshot.requests.total, 1);
/// assert_eq!(snapshot.performance.latency.p50_ms, 12);
/// ```
pub struct MetricsAggregator {
    config: MetricsConfig,
    clock: SharedClock,
    started_at: u64,
    cache: Option<Arc<Cache>>,
    probe: Arc<dyn SystemProbe>,
    state: Mutex<State>,
    sampler: Periodic,
}

impl MetricsAggregator {
    /// Creates an aggregator sampling the host through [`ProcProbe`].
    pub fn new(config: MetricsConfig, clock: SharedClock) -> Self {
        let started_at = clock.now_ms();
        Self {
            state: Mutex::new(State::new(&config, SystemState::default())),
            sampler: Periodic::new("metrics-sampler", config.sample_interval()),
            config,
            clock,
            started_at,
            cache: None,
            probe: Arc::new(ProcProbe::default()),
        }
    }

    /// Reports `cache` statistics in snapshots.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn SystemProbe>) -> Self {
        self.probe = probe;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Records a finished request that started at `started_at_ms` (epoch ms).
    pub fn record_request(&self, meta: &RequestMeta, started_at_ms: u64) {
        let elapsed = self.clock.now_ms().saturating_sub(started_at_ms);
        self.record_latency(meta, Duration::from_millis(elapsed));
    }

    pub fn record_latency(&self, meta: &RequestMeta, latency: Duration) {
        let now = self.clock.now_ms();
        let latency_ms = latency.as_millis() as u64;
        let failed = meta.status >= 400;
        let mut state = self.lock();

        state.total += 1;
        if failed {
            state.failed += 1;
        } else {
            state.success += 1;
        }

        let endpoint = state.endpoints.entry(meta.endpoint.clone()).or_default();
        endpoint.count += 1;
        endpoint.errors += u64::from(failed);
        endpoint.total_time_ms += latency_ms;
        *state.methods.entry(meta.method.clone()).or_default() += 1;
        *state.statuses.entry(meta.status).or_default() += 1;
        state.latencies.push(latency_ms);

        if latency > self.config.slow_request_threshold() {
            debug!(endpoint = %meta.endpoint, latency_ms, "slow request");
            let slow = SlowRequest {
                timestamp: now,
                method: meta.method.clone(),
                endpoint: meta.endpoint.clone(),
                user: meta.user.clone(),
                latency_ms,
                status: meta.status,
            };
            push_bounded(&mut state.slow, slow, self.config.slow_request_log);
        }
    }

    pub fn record_error(&self, meta: ErrorMeta) {
        let now = self.clock.now_ms();
        let kind = meta.kind.label();
        let mut state = self.lock();
        state.error_total += 1;
        *state.error_types.entry(kind.clone()).or_default() += 1;
        let record = ErrorRecord {
            timestamp: now,
            kind,
            message: meta.message,
            endpoint: meta.endpoint,
        };
        push_bounded(&mut state.recent_errors, record, self.config.error_log);
    }

    /// Records one database query for the `db` pass-through figures.
    pub fn record_query(&self, duration: Duration, failed: bool) {
        let mut state = self.lock();
        state.db.queries += 1;
        state.db.errors += u64::from(failed);
        state.db.total_time_ms += duration.as_millis() as u64;
    }

    /// Takes a snapshot. Breakdowns are included when `detailed` is set or
    /// the aggregator is configured as detailed.
    pub fn get_metrics(&self, detailed: bool) -> MetricsSnapshot {
        let now = self.clock.now_ms();
        let cache = self.cache.as_ref().map(|c| c.stats());
        let state = self.lock();

        let details = (detailed || self.config.detailed).then(|| MetricsDetails {
            endpoints: state
                .endpoints
                .iter()
                .map(|(name, stats)| {
                    let avg_time_ms = ratio(stats.total_time_ms, stats.count);
                    (name.clone(), EndpointStats { avg_time_ms, ..stats.clone() })
                })
                .collect(),
            methods: state.methods.clone(),
            statuses: state.statuses.clone(),
            slow_requests: last_n(&state.slow, self.config.detail_entries),
            recent_errors: last_n(&state.recent_errors, self.config.detail_entries),
        });

        MetricsSnapshot {
            timestamp: now,
            uptime_ms: now.saturating_sub(self.started_at),
            requests: RequestSummary {
                total: state.total,
                success: state.success,
                errors: state.failed,
                success_rate: ratio(state.success, state.total),
            },
            performance: PerformanceSummary {
                latency: state.latencies.summary(),
                slow_requests: state.slow.len(),
            },
            errors: ErrorSummary {
                total: state.error_total,
                by_type: state.error_types.clone(),
                error_rate: ratio(state.error_total, state.total),
            },
            system: SystemSummary {
                latest: state.system.history.back().cloned(),
                history: state.system.history.iter().cloned().collect(),
            },
            cache,
            db: DbSummary {
                queries: state.db.queries,
                errors: state.db.errors,
                avg_time_ms: ratio(state.db.total_time_ms, state.db.queries),
            },
            details,
        }
    }

    /// Zeroes request, performance, error and db state. System history is
    /// kept.
    pub fn reset(&self) {
        let mut state = self.lock();
        let system = std::mem::take(&mut state.system);
        *state = State::new(&self.config, system);
        debug!("metrics reset");
    }

    /// Reads the probe once and appends to the system history.
    ///
    /// Returns `None` when neither memory nor CPU could be read.
    pub fn sample_now(&self) -> Option<SystemSample> {
        let memory = self
            .probe
            .memory()
            .inspect_err(|e| warn!(error = %e, "memory probe failed"))
            .ok()
            .map(MemoryUsage::from);
        let cpu_times = self
            .probe
            .cpu_times()
            .inspect_err(|e| warn!(error = %e, "cpu probe failed"))
            .ok();
        if memory.is_none() && cpu_times.is_none() {
            return None;
        }

        let timestamp = self.clock.now_ms();
        let mut state = self.lock();
        let cpu = match (cpu_times, state.system.last_cpu) {
            (Some(current), Some(previous)) => {
                current
                    .usage_since(&previous)
                    .map(|usage_ratio| CpuUsage {
                        usage_ratio,
                        cores: current.cores,
                    })
            }
            _ => None,
        };
        if cpu_times.is_some() {
            state.system.last_cpu = cpu_times;
        }

        let limit = self.config.usage_warning_ratio;
        if let Some(m) = memory.filter(|m| m.usage_ratio > limit) {
            warn!(usage = m.usage_ratio, limit, "high memory usage");
        }
        if let Some(c) = cpu.filter(|c| c.usage_ratio > limit) {
            warn!(usage = c.usage_ratio, limit, "high cpu usage");
        }

        let sample = SystemSample { timestamp, memory, cpu };
        push_bounded(&mut state.system.history, sample.clone(), self.config.system_history);
        Some(sample)
    }

    /// Starts periodic sampling. Returns `false` if already running or
    /// outside a Tokio runtime.
    pub fn start(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        self.sampler.start(move || {
            if let Some(metrics) = weak.upgrade() {
                metrics.sample_now();
            }
        })
    }

    /// Stops periodic sampling. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        self.sampler.stop()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampler.is_running()
    }

    /// A middleware recording every response through this aggregator.
    pub fn middleware(self: &Arc<Self>) -> MetricsMiddleware {
        MetricsMiddleware::new(Arc::clone(self))
    }
}
