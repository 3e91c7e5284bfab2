use crate::listener::EvictionReason;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector for the cache.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Hit/Miss Ratios ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Throughput ---
  pub(crate) inserts: CachePadded<AtomicU64>,
  pub(crate) lock_timeouts: CachePadded<AtomicU64>,

  // --- Eviction Stats ---
  pub(crate) removed: CachePadded<AtomicU64>,
  pub(crate) replaced: CachePadded<AtomicU64>,
  pub(crate) evicted_by_expiration: CachePadded<AtomicU64>,
  pub(crate) evicted_by_capacity: CachePadded<AtomicU64>,
  pub(crate) evicted_by_dependency: CachePadded<AtomicU64>,
  pub(crate) evicted_by_token: CachePadded<AtomicU64>,
  pub(crate) callback_failures: CachePadded<AtomicU64>,
  pub(crate) compactions: CachePadded<AtomicU64>,

  // --- Persistence ---
  pub(crate) loads: CachePadded<AtomicU64>,
  pub(crate) creates: CachePadded<AtomicU64>,
  pub(crate) saves: CachePadded<AtomicU64>,
  pub(crate) save_failures: CachePadded<AtomicU64>,

  // --- Size ---
  pub(crate) current_size: CachePadded<AtomicU64>,

  // --- Timestamps for Uptime ---
  created_at: Instant,
}

// Manual implementation of Default to handle the non-default `Instant`.
impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      inserts: CachePadded::new(AtomicU64::new(0)),
      lock_timeouts: CachePadded::new(AtomicU64::new(0)),
      removed: CachePadded::new(AtomicU64::new(0)),
      replaced: CachePadded::new(AtomicU64::new(0)),
      evicted_by_expiration: CachePadded::new(AtomicU64::new(0)),
      evicted_by_capacity: CachePadded::new(AtomicU64::new(0)),
      evicted_by_dependency: CachePadded::new(AtomicU64::new(0)),
      evicted_by_token: CachePadded::new(AtomicU64::new(0)),
      callback_failures: CachePadded::new(AtomicU64::new(0)),
      compactions: CachePadded::new(AtomicU64::new(0)),
      loads: CachePadded::new(AtomicU64::new(0)),
      creates: CachePadded::new(AtomicU64::new(0)),
      saves: CachePadded::new(AtomicU64::new(0)),
      save_failures: CachePadded::new(AtomicU64::new(0)),
      current_size: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Counts one eviction under its reason.
  pub(crate) fn record_eviction(&self, reason: EvictionReason, size: u64) {
    let counter = match reason {
      EvictionReason::Removed => &self.removed,
      EvictionReason::Replaced => &self.replaced,
      EvictionReason::Expired => &self.evicted_by_expiration,
      EvictionReason::Capacity => &self.evicted_by_capacity,
      EvictionReason::Dependency => &self.evicted_by_dependency,
      EvictionReason::TokenExpired => &self.evicted_by_token,
    };
    Self::bump(counter);
    self.current_size.fetch_sub(size, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + misses;

    MetricsSnapshot {
      hits,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      inserts: self.inserts.load(Ordering::Relaxed),
      lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
      removed: self.removed.load(Ordering::Relaxed),
      replaced: self.replaced.load(Ordering::Relaxed),
      evicted_by_expiration: self.evicted_by_expiration.load(Ordering::Relaxed),
      evicted_by_capacity: self.evicted_by_capacity.load(Ordering::Relaxed),
      evicted_by_dependency: self.evicted_by_dependency.load(Ordering::Relaxed),
      evicted_by_token: self.evicted_by_token.load(Ordering::Relaxed),
      callback_failures: self.callback_failures.load(Ordering::Relaxed),
      compactions: self.compactions.load(Ordering::Relaxed),
      loads: self.loads.load(Ordering::Relaxed),
      creates: self.creates.load(Ordering::Relaxed),
      saves: self.saves.load(Ordering::Relaxed),
      save_failures: self.save_failures.load(Ordering::Relaxed),
      current_size: self.current_size.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of the cache's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// The number of lookups that found a live entry.
  pub hits: u64,
  /// The number of lookups that found nothing or an expired entry.
  pub misses: u64,
  /// The cache hit ratio (hits / (hits + misses)).
  pub hit_ratio: f64,
  /// The number of committed entries.
  pub inserts: u64,
  /// The number of key lock acquisitions that timed out.
  pub lock_timeouts: u64,
  /// Entries removed explicitly.
  pub removed: u64,
  /// Entries replaced by a newer commit.
  pub replaced: u64,
  /// Entries evicted because they expired.
  pub evicted_by_expiration: u64,
  /// Entries evicted to honour the size limit.
  pub evicted_by_capacity: u64,
  /// Entries evicted by a dependency cascade.
  pub evicted_by_dependency: u64,
  /// Entries evicted because an expiration token fired.
  pub evicted_by_token: u64,
  /// Post-eviction callbacks that failed or panicked.
  pub callback_failures: u64,
  /// Completed compaction passes.
  pub compactions: u64,
  /// Successful `load` calls in the persistent layer.
  pub loads: u64,
  /// Successful `create` calls in the persistent layer.
  pub creates: u64,
  /// Successful saves in the persistent layer.
  pub saves: u64,
  /// Failed saves in the persistent layer.
  pub save_failures: u64,
  /// The current total size of all entries.
  pub current_size: u64,
  /// The number of seconds the cache has been running.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio * 100.0))
      .field("inserts", &self.inserts)
      .field("lock_timeouts", &self.lock_timeouts)
      .field("removed", &self.removed)
      .field("replaced", &self.replaced)
      .field("evicted_by_expiration", &self.evicted_by_expiration)
      .field("evicted_by_capacity", &self.evicted_by_capacity)
      .field("evicted_by_dependency", &self.evicted_by_dependency)
      .field("evicted_by_token", &self.evicted_by_token)
      .field("callback_failures", &self.callback_failures)
      .field("compactions", &self.compactions)
      .field("loads", &self.loads)
      .field("creates", &self.creates)
      .field("saves", &self.saves)
      .field("save_failures", &self.save_failures)
      .field("current_size", &self.current_size)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
