//! Clock Abstraction
//!
//! Lease expiry and garbage-collection eligibility are pure functions of
//! "now". All time reads go through [`Clock`] so tests can move time
//! forward deterministically instead of sleeping.
//!
//! - `SystemClock`: wall-clock time
//! - `SimulatedClock`: virtual time, advanced explicitly, shared by clones

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Round to the nearest multiple of `granularity` (half rounds up).
    ///
    /// A zero granularity leaves the timestamp untouched.
    pub fn round_to(self, granularity: Duration) -> Timestamp {
        let step = granularity.as_millis() as u64;
        if step == 0 {
            return self;
        }
        let rem = self.0 % step;
        if rem * 2 >= step {
            Timestamp(self.0 - rem).add_millis(step)
        } else {
            Timestamp(self.0 - rem)
        }
    }

    fn add_millis(self, ms: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(ms))
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        self.add_millis(rhs.as_millis() as u64)
    }
}

impl std::ops::Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_sub(rhs.as_millis() as u64))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Clock trait for time operations
pub trait Clock: Send + Sync + Clone + 'static {
    /// Get current time
    fn now(&self) -> Timestamp;

    /// Get elapsed time since a previous timestamp
    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }
}

/// Wall-clock time, anchored once to `SystemTime` and advanced by a
/// monotonic `Instant` so it never runs backwards within a process.
#[derive(Clone, Debug)]
pub struct SystemClock {
    start: Instant,
    start_millis: u64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SystemClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis + elapsed)
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
#[derive(Clone, Debug)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    /// Create a new simulated clock starting at the given time
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Advance time by the given duration
    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Set time to a specific value
    pub fn set(&self, time: Timestamp) {
        self.time_ms.store(time.0, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}
