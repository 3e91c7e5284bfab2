use crate::clock::{to_nanos, Clock, SystemClock};
use crate::error::BuildError;
use crate::handles::CacheStore;
use crate::listener::EvictionListener;
use crate::lock::{KeyLock, NamedLockRegistry};
use crate::options::{
  CacheOptions, DEFAULT_COMPACTION_PERCENTAGE, DEFAULT_LOCK_TIMEOUT, DEFAULT_SCAN_FREQUENCY,
};
use crate::shared::{SharedParts, StoreShared};
use crate::store::ShardedStore;
use crate::task::compactor::Compactor;
use crate::task::janitor::Janitor;

use core::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// A builder for creating [`CacheStore`] instances.
pub struct CacheBuilder<K, V, H = ahash::RandomState> {
  pub(crate) default_lock_timeout: Duration,
  pub(crate) expiration_scan_frequency: Duration,
  pub(crate) compaction_percentage: f64,
  pub(crate) size_limit: Option<u64>,
  pub(crate) shards: usize,
  pub(crate) hasher: H,
  pub(crate) background_maintenance: bool,
  clock: Arc<dyn Clock>,
  lock_provider: Option<Arc<dyn KeyLock<K>>>,
  listener: Option<Arc<dyn EvictionListener<K, V>>>,
  _value_marker: PhantomData<V>,
}

// Manual Debug implementation for CacheBuilder.
impl<K, V, H> fmt::Debug for CacheBuilder<K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("default_lock_timeout", &self.default_lock_timeout)
      .field("expiration_scan_frequency", &self.expiration_scan_frequency)
      .field("compaction_percentage", &self.compaction_percentage)
      .field("size_limit", &self.size_limit)
      .field("shards", &self.shards)
      .field("background_maintenance", &self.background_maintenance)
      .field("clock", &self.clock)
      .field("has_lock_provider", &self.lock_provider.is_some())
      .field("has_listener", &self.listener.is_some())
      .finish_non_exhaustive()
  }
}

// --- General Configuration Methods ---
impl<K, V, H> CacheBuilder<K, V, H> {
  /// How long key operations wait for the key lock. Defaults to 3 seconds.
  pub fn default_lock_timeout(mut self, timeout: Duration) -> Self {
    self.default_lock_timeout = timeout;
    self
  }

  /// The minimum interval between time-gated compaction passes. Defaults to
  /// 60 seconds.
  pub fn expiration_scan_frequency(mut self, frequency: Duration) -> Self {
    self.expiration_scan_frequency = frequency;
    self
  }

  /// The share of the size limit a capacity pass frees below the limit, and
  /// the share of entries an unbounded pass may expire. Must lie in
  /// `[0.0, 1.0]`. Defaults to 0.05.
  pub fn compaction_percentage(mut self, percentage: f64) -> Self {
    self.compaction_percentage = percentage;
    self
  }

  /// Bounds the total size of all entries. Unbounded by default.
  pub fn size_limit(mut self, limit: u64) -> Self {
    self.size_limit = Some(limit);
    self
  }

  /// Sets the number of concurrent shards to use.
  pub fn shards(mut self, shards: usize) -> Self {
    self.shards = shards;
    self
  }

  /// Whether a janitor thread runs the periodic scan and handles overflow.
  /// When disabled, committing threads do that work inline. Defaults to on.
  pub fn background_maintenance(mut self, enabled: bool) -> Self {
    self.background_maintenance = enabled;
    self
  }

  /// Sets the time source for expirations.
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Sets the per-key lock provider. Defaults to a [`NamedLockRegistry`].
  pub fn lock_provider(mut self, provider: Arc<dyn KeyLock<K>>) -> Self {
    self.lock_provider = Some(provider);
    self
  }

  /// Sets the eviction listener for the cache.
  pub fn eviction_listener<Listener>(mut self, listener: Listener) -> Self
  where
    Listener: EvictionListener<K, V> + 'static,
  {
    self.listener = Some(Arc::new(listener));
    self
  }

  /// Applies every value in `options` that belongs to the store.
  pub fn apply_options(mut self, options: &CacheOptions) -> Self {
    self.default_lock_timeout = options.default_lock_timeout;
    self.expiration_scan_frequency = options.expiration_scan_frequency;
    self.compaction_percentage = options.compaction_percentage;
    self.size_limit = options.size_limit;
    if let Some(shards) = options.shards {
      self.shards = shards;
    }
    self.background_maintenance = options.background_maintenance;
    self
  }
}

// --- Default Constructor ---
impl<K, V, H: BuildHasher + Default> CacheBuilder<K, V, H> {
  /// Creates a new `CacheBuilder` with default settings.
  pub fn new() -> Self {
    Self {
      default_lock_timeout: DEFAULT_LOCK_TIMEOUT,
      expiration_scan_frequency: DEFAULT_SCAN_FREQUENCY,
      compaction_percentage: DEFAULT_COMPACTION_PERCENTAGE,
      size_limit: None,
      shards: (num_cpus::get() * 4).max(1),
      hasher: H::default(),
      background_maintenance: true,
      clock: Arc::new(SystemClock),
      lock_provider: None,
      listener: None,
      _value_marker: PhantomData,
    }
  }

  /// Creates a builder configured from `options`.
  pub fn from_options(options: &CacheOptions) -> Self {
    Self::new().apply_options(options)
  }
}

impl<K, V> Default for CacheBuilder<K, V, ahash::RandomState> {
  fn default() -> Self {
    Self::new()
  }
}

// --- Build Methods ---
impl<K, V, H> CacheBuilder<K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Sets the hasher for the cache.
  pub fn hasher(mut self, hasher: H) -> Self {
    self.hasher = hasher;
    self
  }

  /// Builds the cache.
  pub fn build(self) -> Result<CacheStore<K, V, H>, BuildError> {
    self.validate()?;
    Ok(CacheStore {
      shared: self.build_shared_core(),
    })
  }

  /// Central logic to construct the shared core of the cache.
  pub(crate) fn build_shared_core(self) -> Arc<StoreShared<K, V, H>> {
    let locks = self.lock_provider.unwrap_or_else(|| {
      Arc::new(NamedLockRegistry::with_hasher(
        self.shards,
        self.hasher.clone(),
      )) as Arc<dyn KeyLock<K>>
    });
    let now = to_nanos(self.clock.now());

    let shared = StoreShared::new(SharedParts {
      store: ShardedStore::new(self.shards, self.hasher.clone()),
      locks,
      clock: self.clock,
      hasher: self.hasher,
      compactor: Compactor::new(
        self.expiration_scan_frequency,
        self.compaction_percentage,
        self.size_limit,
        now,
      ),
      listener: self.listener,
      default_lock_timeout: self.default_lock_timeout,
      background_maintenance: self.background_maintenance,
    });

    if self.background_maintenance {
      let janitor = Janitor::spawn(
        Arc::downgrade(&shared),
        shared.compactor.scan_frequency(),
      );
      *shared.janitor.lock() = Some(janitor);
    }
    shared
  }

  /// Validates the builder configuration.
  pub(crate) fn validate(&self) -> Result<(), BuildError> {
    if self.size_limit == Some(0) {
      return Err(BuildError::ZeroCapacity);
    }
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    if !(0.0..=1.0).contains(&self.compaction_percentage) {
      return Err(BuildError::InvalidCompactionPercentage(
        self.compaction_percentage,
      ));
    }
    Ok(())
  }
}
