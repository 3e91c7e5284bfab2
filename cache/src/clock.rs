use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

// The single, static reference point for all timestamps stored in atomics.
// It is initialized lazily on its first use.
static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Converts an `Instant` into nanoseconds since the process-wide epoch.
#[inline]
pub(crate) fn to_nanos(instant: Instant) -> u64 {
  duration_nanos(instant.saturating_duration_since(*CLOCK_EPOCH))
}

/// `duration` in nanoseconds, saturating at `u64::MAX`.
#[inline]
pub(crate) fn duration_nanos(duration: Duration) -> u64 {
  u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

/// A source of the current time.
///
/// The cache never calls `Instant::now()` directly; every expiration and
/// last-use timestamp comes from the configured clock so tests can drive
/// time deterministically with [`ManualClock`].
pub trait Clock: Send + Sync + fmt::Debug {
  fn now(&self) -> Instant;
}

/// The default clock, backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  #[inline]
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  base: Instant,
  elapsed: Mutex<Duration>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      base: *CLOCK_EPOCH,
      elapsed: Mutex::new(Duration::ZERO),
    }
  }

  /// Moves the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    *self.elapsed.lock() += by;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> Instant {
    self.base + *self.elapsed.lock()
  }
}
