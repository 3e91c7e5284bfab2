//! Write-behind object cache on top of [`CacheStore`].
//!
//! Each key holds an [`ObjectSlot`]: the value plus the callbacks that load,
//! create and save it. Values are initialized on first access under the key
//! lock, mutations mark the key dirty, and a background saver writes dirty
//! values back through their `save` callback.

pub(crate) mod dirty;

use crate::builder::CacheBuilder;
use crate::error::{catch_callback, BoxError, BuildError, CacheError};
use crate::handles::CacheStore;
use crate::listener::EvictionReason;
use crate::metrics::Metrics;
use crate::options::{CacheOptions, DEFAULT_SAVE_INTERVAL, DEFAULT_SAVE_LOCK_TIMEOUT};
use crate::task::saver::Saver;

use dirty::DirtySet;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};

/// How long a successful save waits for the dirty set's lock before leaving
/// the key for the next cycle.
const DIRTY_REMOVE_TIMEOUT: Duration = Duration::from_millis(10);

/// Pause between flush cycles that made no progress.
const FLUSH_RETRY_PAUSE: Duration = Duration::from_millis(10);

pub type LoadFn<K, V> = Arc<dyn Fn(&K) -> Result<Option<V>, BoxError> + Send + Sync>;
pub type CreateFn<K, V> = Arc<dyn Fn(&K) -> Result<V, BoxError> + Send + Sync>;
pub type SaveFn<K, V> = Arc<dyn Fn(&K, &V) -> Result<bool, BoxError> + Send + Sync>;

/// The backing-store callbacks of an object.
///
/// `load` fetches an existing object and returns `Ok(None)` when there is
/// none; `create` makes a new one; `save` writes one back and returns
/// whether it succeeded. Any state the callbacks need is captured by the
/// closures.
pub struct ObjectCallbacks<K, V> {
  load: Option<LoadFn<K, V>>,
  create: Option<CreateFn<K, V>>,
  save: Option<SaveFn<K, V>>,
}

impl<K, V> Clone for ObjectCallbacks<K, V> {
  fn clone(&self) -> Self {
    Self {
      load: self.load.clone(),
      create: self.create.clone(),
      save: self.save.clone(),
    }
  }
}

impl<K, V> Default for ObjectCallbacks<K, V> {
  fn default() -> Self {
    Self {
      load: None,
      create: None,
      save: None,
    }
  }
}

impl<K, V> fmt::Debug for ObjectCallbacks<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ObjectCallbacks")
      .field("load", &self.load.is_some())
      .field("create", &self.create.is_some())
      .field("save", &self.save.is_some())
      .finish()
  }
}

impl<K, V> ObjectCallbacks<K, V> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn load<F>(mut self, load: F) -> Self
  where
    F: Fn(&K) -> Result<Option<V>, BoxError> + Send + Sync + 'static,
  {
    self.load = Some(Arc::new(load));
    self
  }

  pub fn create<F>(mut self, create: F) -> Self
  where
    F: Fn(&K) -> Result<V, BoxError> + Send + Sync + 'static,
  {
    self.create = Some(Arc::new(create));
    self
  }

  pub fn save<F>(mut self, save: F) -> Self
  where
    F: Fn(&K, &V) -> Result<bool, BoxError> + Send + Sync + 'static,
  {
    self.save = Some(Arc::new(save));
    self
  }

  /// Whether these callbacks can produce a value for a key on their own.
  pub fn can_produce(&self) -> bool {
    self.load.is_some() || self.create.is_some()
  }
}

/// The value stored in the underlying [`CacheStore`] for each key.
pub struct ObjectSlot<K, V> {
  value: Mutex<Option<V>>,
  callbacks: ObjectCallbacks<K, V>,
  initialized: AtomicBool,
}

impl<K, V> fmt::Debug for ObjectSlot<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ObjectSlot")
      .field("initialized", &self.is_initialized())
      .field("callbacks", &self.callbacks)
      .finish_non_exhaustive()
  }
}

impl<K, V> ObjectSlot<K, V> {
  fn new(callbacks: ObjectCallbacks<K, V>, value: Option<V>) -> Self {
    let initialized = value.is_some();
    Self {
      value: Mutex::new(value),
      callbacks,
      initialized: AtomicBool::new(initialized),
    }
  }

  pub fn is_initialized(&self) -> bool {
    self.initialized.load(Ordering::Acquire)
  }

  pub fn callbacks(&self) -> &ObjectCallbacks<K, V> {
    &self.callbacks
  }

  /// Borrows the value. Every caller holds the key lock, so a busy mutex
  /// means this thread is already inside a `read` or `update` of the key.
  fn borrow_value(&self) -> Result<MutexGuard<'_, Option<V>>, CacheError> {
    self.value.try_lock().ok_or(CacheError::ValueBorrowed)
  }
}

/// The outcome of one or more save cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
  /// Keys whose value was written back.
  pub saved: usize,
  /// Keys cleared without a write: no value yet, or no `save` callback.
  pub skipped: usize,
  /// Keys whose save failed. They stay dirty.
  pub failed: usize,
  /// Keys whose lock was busy. They stay dirty.
  pub retried: usize,
  /// Keys no longer in the cache. They are forgotten.
  pub dropped: usize,
  /// Keys still dirty when the report was taken.
  pub remaining: usize,
}

impl SaveReport {
  fn absorb(&mut self, other: &SaveReport) {
    self.saved += other.saved;
    self.skipped += other.skipped;
    self.failed += other.failed;
    self.retried += other.retried;
    self.dropped += other.dropped;
    self.remaining = other.remaining;
  }
}

struct PersistentInner<K, V, H> {
  store: CacheStore<K, ObjectSlot<K, V>, H>,
  dirty: Arc<DirtySet<K, H>>,
  defaults: ObjectCallbacks<K, V>,
  save_lock_timeout: Duration,
  saver: Mutex<Option<Saver>>,
}

impl<K, V, H> Drop for PersistentInner<K, V, H> {
  fn drop(&mut self) {
    // Ends the saver loop. It may be running this very drop, so no join.
    self.dirty.stop();
  }
}

/// A keyed cache of objects that are loaded on demand and written back
/// asynchronously after they change.
pub struct PersistentObjectCache<K, V, H = ahash::RandomState> {
  inner: Arc<PersistentInner<K, V, H>>,
}

impl<K, V, H> Clone for PersistentObjectCache<K, V, H> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<K, V, H> fmt::Debug for PersistentObjectCache<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PersistentObjectCache")
      .field("store", &self.inner.store)
      .field("dirty", &self.inner.dirty)
      .field("defaults", &self.inner.defaults)
      .finish_non_exhaustive()
  }
}

impl<K, V, H> PersistentObjectCache<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// The underlying store, for eviction callbacks, dependencies and
  /// introspection.
  pub fn store(&self) -> &CacheStore<K, ObjectSlot<K, V>, H> {
    &self.inner.store
  }

  fn metrics(&self) -> &Metrics {
    &self.inner.store.shared.metrics
  }

  // --- Initialization ---

  /// Makes sure `key` holds a value, loading or creating it if needed.
  ///
  /// A key that is not in the cache is registered with the default
  /// callbacks when those can produce a value; otherwise the call fails with
  /// `KeyNotFound`.
  pub fn ensure_initialized(&self, key: &K) -> Result<(), CacheError> {
    let shared = &self.inner.store.shared;
    shared.ensure_live()?;
    let _guard = shared.lock_key(key, shared.default_lock_timeout)?;
    let slot = self.slot_locked(key)?;
    self.initialize(key, &slot)
  }

  /// The slot for `key`, registering one with the default callbacks when
  /// there is none. Callers hold the key lock.
  fn slot_locked(&self, key: &K) -> Result<Arc<ObjectSlot<K, V>>, CacheError> {
    let shared = &self.inner.store.shared;
    if let Some(entry) = shared.live_entry(key) {
      entry.touch(shared.now_nanos());
      return Ok(entry.value());
    }
    if !self.inner.defaults.can_produce() {
      return Err(CacheError::KeyNotFound);
    }
    self.register_locked(key, self.inner.defaults.clone(), None)
  }

  /// Publishes a fresh slot for `key`. Callers hold the key lock; the
  /// provider is reentrant, so the builder takes it again.
  fn register_locked(
    &self,
    key: &K,
    callbacks: ObjectCallbacks<K, V>,
    value: Option<V>,
  ) -> Result<Arc<ObjectSlot<K, V>>, CacheError> {
    let weak = Arc::downgrade(&self.inner);
    self
      .inner
      .store
      .create_entry(key.clone())?
      .post_eviction_callback(
        move |key: &K, slot: &Arc<ObjectSlot<K, V>>, reason: EvictionReason| {
          save_on_eviction(&weak, key, slot, reason)
        },
      )
      .commit(ObjectSlot::new(callbacks, value))
  }

  fn initialize(&self, key: &K, slot: &ObjectSlot<K, V>) -> Result<(), CacheError> {
    if slot.is_initialized() {
      return Ok(());
    }

    let callbacks = &slot.callbacks;
    let (value, created) = match (&callbacks.load, &callbacks.create) {
      (None, None) => {
        slot.initialized.store(true, Ordering::Release);
        return Ok(());
      }
      (Some(load), create) => match catch_callback(|| load(key)) {
        Ok(Some(value)) => {
          Metrics::bump(&self.metrics().loads);
          (value, false)
        }
        Ok(None) => match create {
          Some(create) => (self.create_value(key, create)?, true),
          None => {
            return Err(CacheError::InitializationFailure(
              "load found no value and no create callback is registered".into(),
            ))
          }
        },
        Err(error) => match create {
          Some(create) => {
            tracing::debug!(%error, "load failed, falling back to create");
            (self.create_value(key, create)?, true)
          }
          None => return Err(CacheError::LoadFailure(error)),
        },
      },
      (None, Some(create)) => (self.create_value(key, create)?, true),
    };

    *slot.borrow_value()? = Some(value);
    slot.initialized.store(true, Ordering::Release);
    if created {
      // A new object exists nowhere else yet.
      self.inner.dirty.mark(key, false);
    }
    Ok(())
  }

  fn create_value(&self, key: &K, create: &CreateFn<K, V>) -> Result<V, CacheError> {
    let value = catch_callback(|| create(key)).map_err(CacheError::InitializationFailure)?;
    Metrics::bump(&self.metrics().creates);
    Ok(value)
  }

  // --- Accessors ---

  /// Runs `f` on the value for `key` under the key lock, initializing the
  /// value first if needed.
  ///
  /// The value stays borrowed while `f` runs. Inside `f`, anything that
  /// needs the same key's value, such as a nested `read`, `update`,
  /// `insert` or `ensure_saved`, fails with [`CacheError::ValueBorrowed`],
  /// and removing the key cannot save it on the way out. Other keys are
  /// unaffected.
  pub fn read<R, F>(&self, key: &K, f: F) -> Result<R, CacheError>
  where
    F: FnOnce(&V) -> R,
  {
    let shared = &self.inner.store.shared;
    shared.ensure_live()?;
    let _guard = shared.lock_key(key, shared.default_lock_timeout)?;
    let slot = self.slot_locked(key)?;
    self.initialize(key, &slot)?;

    let value = slot.borrow_value()?;
    match value.as_ref() {
      Some(value) => Ok(f(value)),
      None => Err(empty_slot()),
    }
  }

  /// Mutates the value for `key` under the key lock and marks the key dirty.
  /// The same borrowing rules as [`read`](Self::read) apply inside `f`.
  pub fn update<R, F>(&self, key: &K, f: F) -> Result<R, CacheError>
  where
    F: FnOnce(&mut V) -> R,
  {
    let shared = &self.inner.store.shared;
    shared.ensure_live()?;
    let _guard = shared.lock_key(key, shared.default_lock_timeout)?;
    let slot = self.slot_locked(key)?;
    self.initialize(key, &slot)?;

    let result = {
      let mut value = slot.borrow_value()?;
      match value.as_mut() {
        Some(value) => f(value),
        None => return Err(empty_slot()),
      }
    };
    self.inner.dirty.mark(key, false);
    Ok(result)
  }

  /// A clone of the value for `key`.
  pub fn get_cloned(&self, key: &K) -> Result<V, CacheError>
  where
    V: Clone,
  {
    self.read(key, V::clone)
  }

  /// Stores `value` under `key` and marks the key dirty. An existing slot
  /// keeps its callbacks; a new one gets the default callbacks.
  pub fn insert(&self, key: K, value: V) -> Result<(), CacheError> {
    let shared = &self.inner.store.shared;
    shared.ensure_live()?;
    let _guard = shared.lock_key(&key, shared.default_lock_timeout)?;

    match shared.live_entry(&key) {
      Some(entry) => {
        *entry.value.borrow_value()? = Some(value);
        entry.value.initialized.store(true, Ordering::Release);
      }
      None => {
        self.register_locked(&key, self.inner.defaults.clone(), Some(value))?;
      }
    }
    self.inner.dirty.mark(&key, false);
    Ok(())
  }

  /// Registers `key` with its own callbacks, replacing any existing slot.
  /// The value is loaded or created on first access.
  pub fn register(&self, key: K, callbacks: ObjectCallbacks<K, V>) -> Result<(), CacheError> {
    let shared = &self.inner.store.shared;
    shared.ensure_live()?;
    let _guard = shared.lock_key(&key, shared.default_lock_timeout)?;
    self.register_locked(&key, callbacks, None).map(|_| ())
  }

  // --- Write-behind ---

  /// Marks `key` dirty and wakes the saver; an urgent mark wakes it at
  /// once. Returns whether the key was newly added.
  pub fn set_dirty(&self, key: &K, urgent: bool) -> bool {
    self.inner.dirty.mark(key, urgent)
  }

  pub fn is_dirty(&self, key: &K) -> bool {
    self.inner.dirty.contains(key)
  }

  /// Number of keys waiting to be saved.
  pub fn dirty_len(&self) -> usize {
    self.inner.dirty.len()
  }

  /// Saves the value for `key` now, waiting at most `timeout` for its lock.
  ///
  /// Returns `Ok(true)` when the value was written, `Ok(false)` when there
  /// was nothing to write (no value yet, or no `save` callback). Either way
  /// the key is no longer dirty. A failed save leaves the key dirty.
  pub fn ensure_saved(&self, key: &K, timeout: Duration) -> Result<bool, CacheError> {
    let shared = &self.inner.store.shared;
    shared.ensure_live()?;
    let _guard = shared.lock_key(key, timeout)?;
    let entry = shared.store.get(key).ok_or(CacheError::KeyNotFound)?;

    let saved = self.save_slot(key, &entry.value)?;
    self.inner.dirty.try_remove(key, DIRTY_REMOVE_TIMEOUT);
    Ok(saved)
  }

  fn save_slot(&self, key: &K, slot: &ObjectSlot<K, V>) -> Result<bool, CacheError> {
    save_slot(self.metrics(), key, slot)
  }

  /// Runs one saver cycle: takes the whole dirty set and saves each key.
  /// Keys that are busy or fail go back into the set; keys that left the
  /// cache are forgotten.
  pub fn save_dirty(&self) -> SaveReport {
    let mut report = SaveReport::default();
    let mut retry = Vec::new();

    for key in self.inner.dirty.take_all() {
      match self.ensure_saved(&key, self.inner.save_lock_timeout) {
        Ok(true) => report.saved += 1,
        Ok(false) => report.skipped += 1,
        Err(CacheError::KeyNotFound) => report.dropped += 1,
        Err(CacheError::LockTimeout(_)) => {
          report.retried += 1;
          retry.push(key);
        }
        Err(error) => {
          tracing::warn!(%error, "saving a dirty key failed; it stays dirty");
          report.failed += 1;
          retry.push(key);
        }
      }
    }

    self.inner.dirty.restore(retry);
    report.remaining = self.inner.dirty.len();
    tracing::trace!(?report, "save cycle finished");
    report
  }

  /// Runs save cycles until nothing is dirty or `timeout` has passed.
  pub fn flush(&self, timeout: Duration) -> SaveReport {
    let deadline = Instant::now().checked_add(timeout);
    let mut total = SaveReport::default();

    loop {
      let report = self.save_dirty();
      total.absorb(&report);
      if report.remaining == 0 {
        break;
      }
      let now = Instant::now();
      let left = match deadline {
        Some(deadline) if now >= deadline => break,
        Some(deadline) => deadline - now,
        None => FLUSH_RETRY_PAUSE,
      };
      if report.saved == 0 {
        thread::sleep(FLUSH_RETRY_PAUSE.min(left));
      }
    }
    total
  }

  /// Stops the saver, flushes what is still dirty and disposes the store.
  /// Later operations fail with `AlreadyDisposed`.
  pub fn shutdown(&self) -> SaveReport {
    if self.inner.store.is_disposed() {
      return SaveReport::default();
    }

    self.inner.dirty.stop();
    if let Some(saver) = self.inner.saver.lock().take() {
      saver.join();
    }

    let report = self.flush(self.inner.store.shared.default_lock_timeout);
    if report.remaining > 0 {
      tracing::warn!(remaining = report.remaining, "dirty keys left unsaved at shutdown");
    }
    self.inner.store.dispose();
    report
  }
}

fn empty_slot() -> CacheError {
  CacheError::InitializationFailure("the entry holds no value".into())
}

fn save_slot<K, V>(metrics: &Metrics, key: &K, slot: &ObjectSlot<K, V>) -> Result<bool, CacheError> {
  let Some(save) = &slot.callbacks.save else {
    return Ok(false);
  };
  let value = slot.borrow_value()?;
  let Some(value) = value.as_ref() else {
    return Ok(false);
  };

  match catch_callback(|| save(key, value)) {
    Ok(true) => {
      Metrics::bump(&metrics.saves);
      Ok(true)
    }
    Ok(false) => {
      Metrics::bump(&metrics.save_failures);
      Err(CacheError::SaveFailure("save callback reported failure".into()))
    }
    Err(error) => {
      Metrics::bump(&metrics.save_failures);
      Err(CacheError::SaveFailure(error))
    }
  }
}

/// Writes a dirty slot back as it leaves the cache. A replaced slot is
/// skipped: its key lives on and the saver handles it.
fn save_on_eviction<K, V, H>(
  inner: &Weak<PersistentInner<K, V, H>>,
  key: &K,
  slot: &ObjectSlot<K, V>,
  reason: EvictionReason,
) -> Result<(), BoxError>
where
  K: Eq + Hash + Clone,
  H: BuildHasher + Clone,
{
  if reason == EvictionReason::Replaced {
    return Ok(());
  }
  let Some(inner) = inner.upgrade() else {
    return Ok(());
  };
  if !inner.dirty.contains(key) {
    return Ok(());
  }

  match save_slot(&inner.store.shared.metrics, key, slot) {
    Ok(_) => {
      inner.dirty.remove(key);
      Ok(())
    }
    Err(error) => {
      tracing::warn!(%error, %reason, "could not save a dirty entry on eviction");
      Err(Box::new(error))
    }
  }
}

/// A builder for [`PersistentObjectCache`].
pub struct PersistentCacheBuilder<K, V, H = ahash::RandomState> {
  store: CacheBuilder<K, ObjectSlot<K, V>, H>,
  defaults: ObjectCallbacks<K, V>,
  save_interval: Duration,
  save_lock_timeout: Duration,
  background_saver: bool,
}

impl<K, V, H> fmt::Debug for PersistentCacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PersistentCacheBuilder")
      .field("store", &self.store)
      .field("defaults", &self.defaults)
      .field("save_interval", &self.save_interval)
      .field("save_lock_timeout", &self.save_lock_timeout)
      .field("background_saver", &self.background_saver)
      .finish()
  }
}

impl<K, V, H> CacheBuilder<K, ObjectSlot<K, V>, H> {
  /// Continues configuring a write-behind cache on top of this store.
  pub fn persistent(self) -> PersistentCacheBuilder<K, V, H> {
    PersistentCacheBuilder {
      store: self,
      defaults: ObjectCallbacks::default(),
      save_interval: DEFAULT_SAVE_INTERVAL,
      save_lock_timeout: DEFAULT_SAVE_LOCK_TIMEOUT,
      background_saver: true,
    }
  }
}

impl<K, V, H: BuildHasher + Default> PersistentCacheBuilder<K, V, H> {
  pub fn new() -> Self {
    CacheBuilder::new().persistent()
  }
}

impl<K, V> Default for PersistentCacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

impl<K, V, H> PersistentCacheBuilder<K, V, H> {
  /// Adjusts the underlying store's configuration.
  pub fn store<F>(mut self, configure: F) -> Self
  where
    F: FnOnce(CacheBuilder<K, ObjectSlot<K, V>, H>) -> CacheBuilder<K, ObjectSlot<K, V>, H>,
  {
    self.store = configure(self.store);
    self
  }

  /// Applies store and saver settings from `options`.
  pub fn options(mut self, options: &CacheOptions) -> Self {
    self.store = self.store.apply_options(options);
    self.save_interval = options.save_interval;
    self.save_lock_timeout = options.save_lock_timeout;
    self.background_saver = options.background_saver;
    self
  }

  /// Callbacks for keys that are first seen through an accessor rather than
  /// [`register`](PersistentObjectCache::register).
  pub fn default_callbacks(mut self, callbacks: ObjectCallbacks<K, V>) -> Self {
    self.defaults = callbacks;
    self
  }

  /// The longest the saver sleeps between cycles. Defaults to 5 seconds.
  pub fn save_interval(mut self, interval: Duration) -> Self {
    self.save_interval = interval;
    self
  }

  /// How long the saver waits for each key's lock. Defaults to 100 ms.
  pub fn save_lock_timeout(mut self, timeout: Duration) -> Self {
    self.save_lock_timeout = timeout;
    self
  }

  /// Whether a background thread saves dirty keys. When disabled, call
  /// [`save_dirty`](PersistentObjectCache::save_dirty) or
  /// [`flush`](PersistentObjectCache::flush) yourself. Defaults to on.
  pub fn background_saver(mut self, enabled: bool) -> Self {
    self.background_saver = enabled;
    self
  }
}

impl<K, V, H> PersistentCacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub fn build(self) -> Result<PersistentObjectCache<K, V, H>, BuildError> {
    let hasher = self.store.hasher.clone();
    let store = self.store.build()?;

    let inner = Arc::new(PersistentInner {
      store,
      dirty: Arc::new(DirtySet::new(hasher)),
      defaults: self.defaults,
      save_lock_timeout: self.save_lock_timeout,
      saver: Mutex::new(None),
    });

    if self.background_saver {
      let weak = Arc::downgrade(&inner);
      let saver = Saver::spawn(inner.dirty.clone(), self.save_interval, move || {
        match weak.upgrade() {
          Some(inner) => {
            PersistentObjectCache { inner }.save_dirty();
            true
          }
          None => false,
        }
      });
      *inner.saver.lock() = Some(saver);
    }

    Ok(PersistentObjectCache { inner })
  }
}
