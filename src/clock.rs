//! Time sources.
//!
//! Every component reads time through a [`Clock`] so that TTL expiry, rate
//! windows and latency measurements can be driven deterministically in tests.
//! Timestamps are milliseconds since the Unix epoch.
//!
//! - [`SystemClock`] anchors the wall-clock epoch once at construction and
//!   advances it with a monotonic [`Instant`], so a system clock jump cannot
//!   move cache expiry or rate windows backwards.
//! - [`ManualClock`] only moves when told to.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Shared, type-erased clock handle held by every component.
pub type SharedClock = Arc<dyn Clock>;

/// Monotonic wall clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    anchor: Instant,
    anchor_epoch_ms: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let anchor_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            anchor: Instant::now(),
            anchor_epoch_ms,
        }
    }

    /// Returns a [`SharedClock`] backed by a fresh `SystemClock`.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.anchor_epoch_ms + self.anchor.elapsed().as_millis() as u64
    }
}

/// A clock that only advances when [`advance`](Self::advance) or
/// [`set`](Self::set) is called.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cadence::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now_ms(), 1_250);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
