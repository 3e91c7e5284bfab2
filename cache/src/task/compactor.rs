use crate::clock::duration_nanos;
use crate::entry::{CacheEntry, CacheItemPriority};
use crate::listener::EvictionReason;
use crate::shared::StoreShared;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The outcome of one compaction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
  /// Entries examined.
  pub scanned: usize,
  /// Entries skipped because another thread held their key lock.
  pub skipped: usize,
  /// Entries evicted because they had expired.
  pub expired: usize,
  /// Entries evicted to get back under the size limit.
  pub evicted_for_capacity: usize,
  /// Total size released by this pass.
  pub removed_size: u64,
}

impl CompactionReport {
  /// Total number of entries this pass evicted.
  pub fn evicted(&self) -> usize {
    self.expired + self.evicted_for_capacity
  }
}

/// Configuration and time gate of the compactor.
#[derive(Debug)]
pub(crate) struct Compactor {
  /// Nanoseconds since the clock epoch of the last gated pass.
  last_run: AtomicU64,
  scan_frequency: Duration,
  percentage: f64,
  size_limit: Option<u64>,
}

impl Compactor {
  pub(crate) fn new(
    scan_frequency: Duration,
    percentage: f64,
    size_limit: Option<u64>,
    now: u64,
  ) -> Self {
    Self {
      last_run: AtomicU64::new(now),
      scan_frequency,
      percentage,
      size_limit,
    }
  }

  #[inline]
  pub(crate) fn size_limit(&self) -> Option<u64> {
    self.size_limit
  }

  #[inline]
  pub(crate) fn scan_frequency(&self) -> Duration {
    self.scan_frequency
  }

  /// Claims the next gated pass if the scan interval has elapsed.
  /// Exactly one of several racing callers wins.
  pub(crate) fn claim_due(&self, now: u64) -> bool {
    let last = self.last_run.load(Ordering::Acquire);
    if now.saturating_sub(last) < duration_nanos(self.scan_frequency) {
      return false;
    }
    self
      .last_run
      .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
  }

  /// How much size a capacity pass has to release: whatever lies above
  /// `limit * (1 - percentage)`.
  fn capacity_target(&self, limit: u64, current_size: u64) -> u64 {
    let keep = (limit as f64 * (1.0 - self.percentage)).floor() as u64;
    current_size.saturating_sub(keep)
  }

  /// Upper bound on expirations per pass for an unbounded cache.
  fn expiry_budget(&self, total: usize) -> usize {
    ((total as f64 * self.percentage).floor() as usize).max(1)
  }
}

/// Runs one compaction pass over the store.
pub(crate) fn run<K, V, H>(shared: &StoreShared<K, V, H>) -> CompactionReport
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  match shared.compactor.size_limit() {
    None => expire_unbounded(shared),
    Some(limit) => compact_to_capacity(shared, limit),
  }
}

fn expire_unbounded<K, V, H>(shared: &StoreShared<K, V, H>) -> CompactionReport
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  let mut report = CompactionReport::default();
  let entries = shared.store.snapshot();
  let budget = shared.compactor.expiry_budget(entries.len());
  let now = shared.now_nanos();

  for (key, entry) in entries {
    if report.expired >= budget {
      break;
    }
    report.scanned += 1;

    let Some(_guard) = shared.try_lock_key(&key) else {
      report.skipped += 1;
      continue;
    };
    if entry.is_expired(now) && shared.evict_implicit(&key, &entry, EvictionReason::Expired) {
      report.expired += 1;
      report.removed_size += entry.size();
    }
  }
  report
}

type Candidate<K, V> = (K, Arc<CacheEntry<K, V>>);

fn compact_to_capacity<K, V, H>(shared: &StoreShared<K, V, H>, limit: u64) -> CompactionReport
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  let mut report = CompactionReport::default();
  let current_size = shared.metrics.current_size.load(Ordering::Relaxed);
  let target = shared.compactor.capacity_target(limit, current_size);
  let now = shared.now_nanos();

  // Buckets for Low, Normal and High. NeverRemove entries only ever expire.
  let mut buckets: [Vec<Candidate<K, V>>; 3] = Default::default();

  // 1. Expire what has expired, remembering the live entries as candidates.
  for (key, entry) in shared.store.snapshot() {
    report.scanned += 1;
    let Some(_guard) = shared.try_lock_key(&key) else {
      report.skipped += 1;
      continue;
    };

    if entry.is_expired(now) {
      if shared.evict_implicit(&key, &entry, EvictionReason::Expired) {
        report.expired += 1;
        report.removed_size += entry.size();
      }
      continue;
    }

    let bucket = match entry.priority() {
      CacheItemPriority::Low => 0,
      CacheItemPriority::Normal => 1,
      CacheItemPriority::High => 2,
      CacheItemPriority::NeverRemove => continue,
    };
    buckets[bucket].push((key, entry));
  }

  if report.removed_size >= target {
    return report;
  }

  // 2. Least recently used first within each bucket, lowest priority first.
  'buckets: for mut bucket in buckets {
    bucket.sort_by_key(|(_, entry)| entry.last_used());
    for (key, entry) in bucket {
      if report.removed_size >= target {
        break 'buckets;
      }
      let Some(_guard) = shared.try_lock_key(&key) else {
        report.skipped += 1;
        continue;
      };
      if shared.evict_implicit(&key, &entry, EvictionReason::Capacity) {
        report.evicted_for_capacity += 1;
        report.removed_size += entry.size();
      }
    }
  }

  if report.removed_size < target {
    tracing::debug!(
      target_size = target,
      removed = report.removed_size,
      "compaction could not release the full target"
    );
  }
  report
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn gate_admits_one_pass_per_interval() {
    let compactor = Compactor::new(Duration::from_secs(60), 0.05, None, 0);
    let minute = Duration::from_secs(60).as_nanos() as u64;

    assert!(!compactor.claim_due(minute - 1));
    assert!(compactor.claim_due(minute));
    assert!(!compactor.claim_due(minute + 1));
    assert!(compactor.claim_due(2 * minute));
  }

  #[test]
  fn capacity_target_leaves_headroom() {
    let compactor = Compactor::new(Duration::from_secs(60), 0.25, Some(100), 0);
    assert_eq!(compactor.capacity_target(100, 110), 35);
    assert_eq!(compactor.capacity_target(100, 60), 0);
  }

  #[test]
  fn expiry_budget_is_at_least_one() {
    let compactor = Compactor::new(Duration::from_secs(60), 0.05, None, 0);
    assert_eq!(compactor.expiry_budget(0), 1);
    assert_eq!(compactor.expiry_budget(10), 1);
    assert_eq!(compactor.expiry_budget(100), 5);
  }
}
