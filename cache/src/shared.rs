use crate::clock::{to_nanos, Clock};
use crate::dependency::DependencyGraph;
use crate::entry::CacheEntry;
use crate::error::{catch_callback, BoxError, CacheError, CallbackErrors};
use crate::eviction::{EvictionCoordinator, PriorityCallback};
use crate::listener::{EvictionListener, EvictionReason, PostEvictionCallback};
use crate::lock::{KeyLock, KeyLockGuard};
use crate::metrics::Metrics;
use crate::store::ShardedStore;
use crate::task::compactor::{self, CompactionReport, Compactor};
use crate::task::janitor::Janitor;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

/// The internal, thread-safe core of the cache.
pub(crate) struct StoreShared<K, V, H> {
  pub(crate) store: ShardedStore<K, V, H>,
  pub(crate) locks: Arc<dyn KeyLock<K>>,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) coordinator: EvictionCoordinator<K, V, H>,
  pub(crate) dependencies: DependencyGraph<K, H>,
  pub(crate) compactor: Compactor,
  pub(crate) metrics: Metrics,
  pub(crate) listener: Option<Arc<dyn EvictionListener<K, V>>>,
  pub(crate) default_lock_timeout: Duration,
  pub(crate) background_maintenance: bool,
  pub(crate) janitor: Mutex<Option<Janitor>>,
  disposed: AtomicBool,
  self_ref: Weak<Self>,
}

impl<K, V, H> fmt::Debug for StoreShared<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StoreShared")
      .field("size_limit", &self.compactor.size_limit())
      .field("default_lock_timeout", &self.default_lock_timeout)
      .field("disposed", &self.disposed.load(Ordering::Relaxed))
      .field("metrics", &self.metrics.snapshot())
      .finish_non_exhaustive()
  }
}

impl<K, V, H> Drop for StoreShared<K, V, H> {
  fn drop(&mut self) {
    if let Some(janitor) = self.janitor.get_mut().take() {
      janitor.stop();
    }
  }
}

/// Everything `StoreShared::new` needs besides the self reference.
pub(crate) struct SharedParts<K, V, H> {
  pub(crate) store: ShardedStore<K, V, H>,
  pub(crate) locks: Arc<dyn KeyLock<K>>,
  pub(crate) clock: Arc<dyn Clock>,
  pub(crate) hasher: H,
  pub(crate) compactor: Compactor,
  pub(crate) listener: Option<Arc<dyn EvictionListener<K, V>>>,
  pub(crate) default_lock_timeout: Duration,
  pub(crate) background_maintenance: bool,
}

impl<K, V, H> StoreShared<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn new(parts: SharedParts<K, V, H>) -> Arc<Self> {
    Arc::new_cyclic(|self_ref| Self {
      store: parts.store,
      locks: parts.locks,
      clock: parts.clock,
      coordinator: EvictionCoordinator::new(parts.hasher.clone()),
      dependencies: DependencyGraph::new(parts.hasher),
      compactor: parts.compactor,
      metrics: Metrics::new(),
      listener: parts.listener,
      default_lock_timeout: parts.default_lock_timeout,
      background_maintenance: parts.background_maintenance,
      janitor: Mutex::new(None),
      disposed: AtomicBool::new(false),
      self_ref: self_ref.clone(),
    })
  }

  #[inline]
  pub(crate) fn ensure_live(&self) -> Result<(), CacheError> {
    if self.disposed.load(Ordering::Acquire) {
      Err(CacheError::AlreadyDisposed)
    } else {
      Ok(())
    }
  }

  #[inline]
  pub(crate) fn now_nanos(&self) -> u64 {
    to_nanos(self.clock.now())
  }

  /// Acquires `key`, counting and reporting a timeout as `LockTimeout`.
  pub(crate) fn lock_key(
    &self,
    key: &K,
    timeout: Duration,
  ) -> Result<KeyLockGuard<'_, K>, CacheError> {
    KeyLockGuard::acquire(self.locks.as_ref(), key.clone(), timeout).ok_or_else(|| {
      Metrics::bump(&self.metrics.lock_timeouts);
      CacheError::LockTimeout(timeout)
    })
  }

  /// Acquires `key` only if nobody else holds it.
  pub(crate) fn try_lock_key(&self, key: &K) -> Option<KeyLockGuard<'_, K>> {
    KeyLockGuard::acquire(self.locks.as_ref(), key.clone(), Duration::ZERO)
  }

  /// Returns the live entry for `key`. An entry found expired is evicted with
  /// `Expired` and reported as absent. Callers hold the key lock.
  pub(crate) fn live_entry(&self, key: &K) -> Option<Arc<CacheEntry<K, V>>> {
    let entry = self.store.get(key)?;
    if entry.is_expired(self.now_nanos()) {
      self.evict_implicit(key, &entry, EvictionReason::Expired);
      None
    } else {
      Some(entry)
    }
  }

  /// Publishes `entry` under `key`, evicting the entry it replaces, then
  /// queues its priority callbacks and subscribes it to its tokens. Tokens
  /// come last because an already cancelled token evicts the entry on the
  /// spot. Callers hold the key lock.
  pub(crate) fn publish(
    &self,
    key: &K,
    entry: Arc<CacheEntry<K, V>>,
    priority_callbacks: Vec<(PriorityCallback<K, V>, i32)>,
  ) {
    if self.dependencies.has_dependents(key) {
      self.attach_cascade(&entry);
    }

    self
      .metrics
      .current_size
      .fetch_add(entry.size(), Ordering::Relaxed);
    Metrics::bump(&self.metrics.inserts);

    if let Some(previous) = self.store.insert(key.clone(), entry.clone()) {
      if let Err(errors) = self.finish_eviction(key, &previous, EvictionReason::Replaced) {
        tracing::warn!(failures = errors.len(), "post-eviction callbacks failed on replace");
      }
    }

    for (callback, priority) in priority_callbacks {
      self.register_priority_callback(key, &entry, Some(callback), priority);
    }
    self.register_tokens(key, &entry);
  }

  /// Removes `key` and runs its eviction callbacks with `reason`.
  /// Returns whether an entry was removed. Callers hold the key lock.
  pub(crate) fn remove_locked(
    &self,
    key: &K,
    reason: EvictionReason,
  ) -> Result<bool, CallbackErrors> {
    match self.store.remove(key) {
      Some(entry) => self.finish_eviction(key, &entry, reason).map(|()| true),
      None => Ok(false),
    }
  }

  /// Removes `entry` if it is still the one stored under `key`, logging any
  /// callback failures. Callers hold the key lock.
  pub(crate) fn evict_implicit(
    &self,
    key: &K,
    entry: &Arc<CacheEntry<K, V>>,
    reason: EvictionReason,
  ) -> bool {
    let Some(removed) = self.store.remove_if_same(key, entry) else {
      return false;
    };
    if let Err(errors) = self.finish_eviction(key, &removed, reason) {
      tracing::warn!(
        failures = errors.len(),
        %reason,
        "post-eviction callbacks failed"
      );
    }
    true
  }

  /// Locks `key` and evicts `entry` if it is still current. Used from
  /// contexts that do not already hold the lock, such as token callbacks.
  pub(crate) fn evict_if_current(
    &self,
    key: &K,
    entry: &Arc<CacheEntry<K, V>>,
    reason: EvictionReason,
  ) {
    if self.ensure_live().is_err() || entry.is_evicted() {
      return;
    }
    match self.lock_key(key, self.default_lock_timeout) {
      Ok(_guard) => {
        self.evict_implicit(key, entry, reason);
      }
      Err(error) => tracing::warn!(%error, %reason, "could not lock key to evict it"),
    }
  }

  /// Runs the eviction work for an entry that has just left the store:
  /// size accounting, token cleanup, the entry's own callbacks in order, then
  /// the cache-wide listener. Runs at most once per entry.
  pub(crate) fn finish_eviction(
    &self,
    key: &K,
    entry: &Arc<CacheEntry<K, V>>,
    reason: EvictionReason,
  ) -> Result<(), CallbackErrors> {
    if !entry.mark_evicted() {
      return Ok(());
    }
    // A replacing commit has already rebuilt the key's edges.
    if reason != EvictionReason::Replaced {
      self.dependencies.detach(key);
    }
    self.metrics.record_eviction(reason, entry.size());
    entry.unregister_tokens();

    let mut errors = CallbackErrors::default();
    for callback in entry.take_callbacks() {
      if let Err(error) = catch_callback(|| callback(key, &entry.value, reason)) {
        errors.absorb(error);
      }
    }

    if let Some(listener) = &self.listener {
      let notified = catch_callback(|| {
        listener.on_evict(key, &entry.value, reason);
        Ok(())
      });
      if let Err(error) = notified {
        errors.push(error);
      }
    }

    if !errors.is_empty() {
      self
        .metrics
        .callback_failures
        .fetch_add(errors.len() as u64, Ordering::Relaxed);
    }
    errors.into_result()
  }

  /// Subscribes the entry to its expiration tokens so that cancelling any of
  /// them evicts it with `TokenExpired`.
  fn register_tokens(&self, key: &K, entry: &Arc<CacheEntry<K, V>>) {
    for token in entry.tokens() {
      let shared = self.self_ref.clone();
      let weak_entry = Arc::downgrade(entry);
      let key = key.clone();
      let registration = token.register(Box::new(move || {
        if let (Some(shared), Some(entry)) = (shared.upgrade(), weak_entry.upgrade()) {
          shared.evict_if_current(&key, &entry, EvictionReason::TokenExpired);
        }
      }));
      if let Some(registration) = registration {
        entry.remember_token_registration(token.clone(), registration);
      }
    }
  }

  // --- Priority eviction ---

  /// The hook that hands a removal over to the coordinator.
  fn coordinator_hook(&self) -> PostEvictionCallback<K, V> {
    let shared = self.self_ref.clone();
    Arc::new(
      move |key: &K, value: &Arc<V>, reason: EvictionReason| match shared.upgrade() {
        Some(shared) => shared
          .coordinator
          .execute_callbacks(key, value, reason)
          .map_err(|errors| Box::new(errors) as BoxError),
        None => Ok(()),
      },
    )
  }

  /// Queues `callback` on the live entry for `key`, attaching the
  /// coordinator hook when the entry does not carry one yet. Callers hold
  /// the key lock.
  pub(crate) fn register_priority_callback(
    &self,
    key: &K,
    entry: &Arc<CacheEntry<K, V>>,
    callback: Option<PriorityCallback<K, V>>,
    priority: i32,
  ) {
    if self.coordinator.register(key, callback, priority) {
      entry.push_callback(self.coordinator_hook());
    }
  }

  // --- Dependencies ---

  /// Records that `key` depends on `target` and, if the target is live,
  /// makes sure it carries the cascade hook.
  ///
  /// The hook is attached without taking the target's lock: the caller
  /// often holds the dependent's lock, and the cascade locks in the
  /// opposite direction. If the target is mid-eviction the hook is dropped
  /// and attached again when the target is next committed.
  pub(crate) fn add_dependency(&self, key: &K, target: &K) -> Result<(), CacheError> {
    self.dependencies.add(key, target)?;
    if let Some(entry) = self.store.get(target) {
      self.attach_cascade(&entry);
    }
    Ok(())
  }

  /// Makes `targets` the complete set of keys that `key` depends on,
  /// dropping the edges of any earlier entry under `key`. Nothing changes
  /// when one of the new edges would close a cycle. Callers hold the key lock.
  pub(crate) fn set_dependencies(&self, key: &K, targets: &[K]) -> Result<(), CacheError> {
    self.dependencies.replace(key, targets)?;
    for target in targets {
      if let Some(entry) = self.store.get(target) {
        self.attach_cascade(&entry);
      }
    }
    Ok(())
  }

  fn attach_cascade(&self, entry: &Arc<CacheEntry<K, V>>) {
    if !entry.claim_cascade() {
      return;
    }
    let shared = self.self_ref.clone();
    entry.push_callback(Arc::new(
      move |key: &K, _value: &Arc<V>, _reason: EvictionReason| match shared.upgrade() {
        Some(shared) => shared
          .cascade(key)
          .map_err(|errors| Box::new(errors) as BoxError),
        None => Ok(()),
      },
    ));
  }

  /// Removes every dependent of `target` with reason `Dependency`, then
  /// forgets the target's edges.
  fn cascade(&self, target: &K) -> Result<(), CallbackErrors> {
    let mut errors = CallbackErrors::default();

    for dependent in self.dependencies.dependents_of(target) {
      match self.lock_key(&dependent, self.default_lock_timeout) {
        Ok(_guard) => {
          if let Err(nested) = self.remove_locked(&dependent, EvictionReason::Dependency) {
            errors.extend(nested);
          }
        }
        Err(error) => {
          tracing::warn!(%error, "could not lock a dependent during cascade");
          errors.push(Box::new(error));
        }
      }
    }

    self.dependencies.forget(target);
    errors.into_result()
  }

  // --- Compaction ---

  /// Runs a compaction pass now.
  pub(crate) fn compact(&self) -> CompactionReport {
    let report = compactor::run(self);
    Metrics::bump(&self.metrics.compactions);
    tracing::debug!(?report, "compaction pass finished");
    report
  }

  /// Runs a compaction pass if the scan interval has elapsed since the last
  /// one. Concurrent callers race on a CAS and at most one of them runs.
  pub(crate) fn scan_for_expired_if_due(&self) -> Option<CompactionReport> {
    if self.compactor.claim_due(self.now_nanos()) {
      Some(self.compact())
    } else {
      None
    }
  }

  /// Maintenance run by the committing thread once it has released the key
  /// lock: react to overflow, then the time-gated scan.
  pub(crate) fn after_commit(&self) {
    let over_limit = self
      .compactor
      .size_limit()
      .is_some_and(|limit| self.metrics.current_size.load(Ordering::Relaxed) > limit);

    if over_limit {
      if self.background_maintenance {
        if let Some(janitor) = self.janitor.lock().as_ref() {
          janitor.nudge();
          return;
        }
      }
      self.compact();
      return;
    }

    self.scan_for_expired_if_due();
  }

  /// Stops background work. Every later operation fails with `AlreadyDisposed`.
  pub(crate) fn dispose(&self) {
    if self.disposed.swap(true, Ordering::AcqRel) {
      return;
    }
    if let Some(janitor) = self.janitor.lock().take() {
      janitor.stop_and_join();
    }
    tracing::debug!("cache disposed");
  }

  pub(crate) fn is_disposed(&self) -> bool {
    self.disposed.load(Ordering::Acquire)
  }
}
