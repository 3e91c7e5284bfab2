use crate::dependency::DependencyGraph;
use crate::entry_api::EntryBuilder;
use crate::error::{CacheError, CallbackErrors};
use crate::eviction::{EvictionCoordinator, PriorityCallback};
use crate::listener::EvictionReason;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::shared::StoreShared;
use crate::task::compactor::CompactionReport;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// A thread-safe, keyed cache with per-key locking.
///
/// Every operation on a key runs under that key's lock, so operations on the
/// same key are totally ordered while unrelated keys never contend. Cloning
/// the handle is cheap and shares the same cache.
pub struct CacheStore<K, V, H = ahash::RandomState> {
  pub(crate) shared: Arc<StoreShared<K, V, H>>,
}

impl<K, V, H> Clone for CacheStore<K, V, H> {
  fn clone(&self) -> Self {
    Self {
      shared: self.shared.clone(),
    }
  }
}

impl<K, V, H> fmt::Debug for CacheStore<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheStore")
      .field("shared", &self.shared)
      .finish()
  }
}

impl<K, V, H> CacheStore<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Locks `key` with the default timeout and returns a builder for a new
  /// entry. The lock is held until the builder is committed or dropped.
  pub fn create_entry(&self, key: K) -> Result<EntryBuilder<'_, K, V, H>, CacheError> {
    self.shared.ensure_live()?;
    let guard = self
      .shared
      .lock_key(&key, self.shared.default_lock_timeout)?;
    Ok(EntryBuilder::new(&self.shared, guard))
  }

  /// Fetches the value for `key`, restarting its sliding expiration.
  ///
  /// Returns `Ok(None)` on a miss. An entry found expired is evicted with
  /// `Expired` and reported as a miss.
  pub fn get(&self, key: &K) -> Result<Option<Arc<V>>, CacheError> {
    self.get_with_timeout(key, self.shared.default_lock_timeout)
  }

  /// Like [`get`](Self::get) with an explicit lock timeout.
  pub fn get_with_timeout(
    &self,
    key: &K,
    timeout: Duration,
  ) -> Result<Option<Arc<V>>, CacheError> {
    self.shared.ensure_live()?;
    let _guard = self.shared.lock_key(key, timeout)?;

    match self.shared.live_entry(key) {
      Some(entry) => {
        entry.touch(self.shared.now_nanos());
        Metrics::bump(&self.shared.metrics.hits);
        Ok(Some(entry.value()))
      }
      None => {
        Metrics::bump(&self.shared.metrics.misses);
        Ok(None)
      }
    }
  }

  /// Returns the value for `key`, creating it with `factory` under the key
  /// lock when there is none. Concurrent callers for the same key run the
  /// factory at most once between them.
  pub fn get_or_create<F>(&self, key: K, factory: F) -> Result<Arc<V>, CacheError>
  where
    F: FnOnce(&K) -> V,
  {
    let builder = self.create_entry(key)?;
    if let Some(value) = builder.current() {
      Metrics::bump(&self.shared.metrics.hits);
      return Ok(value);
    }
    Metrics::bump(&self.shared.metrics.misses);
    let value = factory(builder.key());
    builder.commit(value)
  }

  /// Inserts `value` with default entry options, replacing any prior entry.
  pub fn insert(&self, key: K, value: V) -> Result<Arc<V>, CacheError> {
    self.create_entry(key)?.commit(value)
  }

  /// Removes `key`, running its eviction callbacks with `reason`.
  ///
  /// Returns whether an entry was removed. When callbacks fail the removal
  /// has still happened and the failures come back as
  /// [`CacheError::Callbacks`].
  pub fn remove(&self, key: &K, reason: EvictionReason) -> Result<bool, CacheError> {
    self.shared.ensure_live()?;
    let _guard = self
      .shared
      .lock_key(key, self.shared.default_lock_timeout)?;
    Ok(self.shared.remove_locked(key, reason)?)
  }

  /// Removes `key` with reason `Removed`.
  pub fn invalidate(&self, key: &K) -> Result<bool, CacheError> {
    self.remove(key, EvictionReason::Removed)
  }

  /// Removes every entry with reason `Removed`. Keys whose lock cannot be
  /// taken within the default timeout are left in place.
  pub fn clear(&self) -> Result<(), CacheError> {
    self.shared.ensure_live()?;
    let mut errors = CallbackErrors::default();
    for key in self.shared.store.keys() {
      match self.shared.lock_key(&key, self.shared.default_lock_timeout) {
        Ok(_guard) => {
          if let Err(failed) = self.shared.remove_locked(&key, EvictionReason::Removed) {
            errors.extend(failed);
          }
        }
        Err(error) => tracing::warn!(%error, "clear skipped a locked key"),
      }
    }
    Ok(errors.into_result()?)
  }

  /// Runs a compaction pass now, regardless of the scan interval.
  ///
  /// Without a size limit a pass expires at most
  /// `max(1, entries * compaction_percentage)` entries, so a single pass,
  /// including one run by the janitor, may leave expired entries behind.
  /// They are still never returned by reads, which evict them on sight.
  pub fn compact(&self) -> Result<CompactionReport, CacheError> {
    self.shared.ensure_live()?;
    Ok(self.shared.compact())
  }

  /// Runs a compaction pass only if the scan interval has elapsed since the
  /// last one. Returns `None` when no pass was due.
  pub fn scan_for_expired_if_due(&self) -> Result<Option<CompactionReport>, CacheError> {
    self.shared.ensure_live()?;
    Ok(self.shared.scan_for_expired_if_due())
  }

  // --- Reference counting and priority callbacks ---

  /// Pins `key` so that priority callbacks for a removal wait until the pin
  /// is released. Returns the new reference count.
  pub fn add_ref(&self, key: &K) -> i64 {
    self.shared.coordinator.add_ref(key)
  }

  /// Drops one pin on `key`. If this was the last pin and the key was
  /// removed while pinned, its priority callbacks run now on this thread.
  /// A release without a matching `add_ref` does nothing.
  pub fn release(&self, key: &K) -> Result<(), CacheError> {
    Ok(self.shared.coordinator.release(key)?)
  }

  /// Queues `callback` on the priority queue of the live entry for `key`.
  ///
  /// Without a callback this only arms the key, taking the implicit
  /// reference the eviction hook releases on removal.
  pub fn enable_priority_eviction(
    &self,
    key: &K,
    callback: Option<PriorityCallback<K, V>>,
    priority: i32,
  ) -> Result<(), CacheError> {
    self.shared.ensure_live()?;
    let _guard = self
      .shared
      .lock_key(key, self.shared.default_lock_timeout)?;
    let entry = self
      .shared
      .live_entry(key)
      .ok_or(CacheError::KeyNotFound)?;
    self
      .shared
      .register_priority_callback(key, &entry, callback, priority);
    Ok(())
  }

  /// Makes `key` depend on each of `targets`: evicting a target evicts `key`
  /// with reason `Dependency`.
  ///
  /// Fails with `DependencyCycle` if an edge would let an eviction cascade
  /// back to where it started. Edges added before the failing one stay.
  /// The edges last until `key` is evicted or committed again.
  pub fn add_dependency(&self, key: &K, targets: &[K]) -> Result<(), CacheError> {
    self.shared.ensure_live()?;
    for target in targets {
      self.shared.add_dependency(key, target)?;
    }
    Ok(())
  }

  // --- Introspection ---

  /// Whether an entry is stored for `key`. Does not take the key lock, so
  /// an entry that expired but has not been evicted yet still counts.
  pub fn contains_key(&self, key: &K) -> bool {
    self.shared.store.contains(key)
  }

  /// The number of stored entries.
  pub fn len(&self) -> usize {
    self.shared.store.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// The total size of all stored entries.
  pub fn size(&self) -> u64 {
    self.shared.metrics.current_size.load(Ordering::Relaxed)
  }

  /// The configured size limit, if any.
  pub fn size_limit(&self) -> Option<u64> {
    self.shared.compactor.size_limit()
  }

  /// A point-in-time copy of the stored keys.
  pub fn keys(&self) -> Vec<K> {
    self.shared.store.keys()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  /// The per-key reference counts and priority queues.
  pub fn coordinator(&self) -> &EvictionCoordinator<K, V, H> {
    &self.shared.coordinator
  }

  /// The dependency edges between keys.
  pub fn dependencies(&self) -> &DependencyGraph<K, H> {
    &self.shared.dependencies
  }

  /// Stops background maintenance. Every later operation that touches
  /// entries fails with [`CacheError::AlreadyDisposed`].
  pub fn dispose(&self) {
    self.shared.dispose();
  }

  pub fn is_disposed(&self) -> bool {
    self.shared.is_disposed()
  }
}
