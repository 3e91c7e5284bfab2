use crate::clock::duration_nanos;
use crate::listener::PostEvictionCallback;
use crate::token::{ExpirationToken, TokenRegistration};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The relative importance of an entry when the cache is over capacity.
///
/// Capacity compaction drains `Low` entries first, then `Normal`, then
/// `High`. `NeverRemove` entries are never evicted for capacity but still
/// expire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CacheItemPriority {
  Low,
  #[default]
  Normal,
  High,
  NeverRemove,
}

/// A container for a value in the cache, holding all necessary metadata.
pub(crate) struct CacheEntry<K, V> {
  /// The user's value, wrapped in an Arc for shared ownership.
  pub(crate) value: Arc<V>,
  /// The size charged against the cache's size limit.
  size: u64,
  priority: CacheItemPriority,
  /// Absolute expiration in nanoseconds since the clock epoch.
  absolute_expiration: Option<u64>,
  sliding_expiration: Option<Duration>,
  /// The last access timestamp in nanoseconds since the clock epoch.
  last_used: AtomicU64,
  tokens: Vec<ExpirationToken>,
  token_registrations: Mutex<Vec<(ExpirationToken, TokenRegistration)>>,
  callbacks: Mutex<Vec<PostEvictionCallback<K, V>>>,
  /// Set once the dependency cascade hook sits in `callbacks`.
  cascade_attached: AtomicBool,
  /// Set once the entry has left the store. Its callbacks have run or are running.
  evicted: AtomicBool,
}

pub(crate) struct EntrySettings<K, V> {
  pub(crate) size: u64,
  pub(crate) priority: CacheItemPriority,
  pub(crate) absolute_expiration: Option<u64>,
  pub(crate) sliding_expiration: Option<Duration>,
  pub(crate) tokens: Vec<ExpirationToken>,
  pub(crate) callbacks: Vec<PostEvictionCallback<K, V>>,
}

impl<K, V> CacheEntry<K, V> {
  /// Creates a new `CacheEntry` last used at `now`.
  pub(crate) fn new(value: Arc<V>, settings: EntrySettings<K, V>, now: u64) -> Self {
    Self {
      value,
      size: settings.size,
      priority: settings.priority,
      absolute_expiration: settings.absolute_expiration,
      sliding_expiration: settings.sliding_expiration,
      last_used: AtomicU64::new(now),
      tokens: settings.tokens,
      token_registrations: Mutex::new(Vec::new()),
      callbacks: Mutex::new(settings.callbacks),
      cascade_attached: AtomicBool::new(false),
      evicted: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn value(&self) -> Arc<V> {
    self.value.clone()
  }

  #[inline]
  pub(crate) fn size(&self) -> u64 {
    self.size
  }

  #[inline]
  pub(crate) fn priority(&self) -> CacheItemPriority {
    self.priority
  }

  #[inline]
  pub(crate) fn last_used(&self) -> u64 {
    self.last_used.load(Ordering::Relaxed)
  }

  /// Records an access at `now`, restarting the sliding window.
  #[inline]
  pub(crate) fn touch(&self, now: u64) {
    self.last_used.store(now, Ordering::Relaxed);
  }

  /// Checks if the entry is expired by time or by one of its tokens.
  pub(crate) fn is_expired(&self, now: u64) -> bool {
    if let Some(at) = self.absolute_expiration {
      if now >= at {
        return true;
      }
    }

    if let Some(window) = self.sliding_expiration {
      if now >= self.last_used().saturating_add(duration_nanos(window)) {
        return true;
      }
    }

    self.tokens.iter().any(ExpirationToken::is_cancelled)
  }

  pub(crate) fn tokens(&self) -> &[ExpirationToken] {
    &self.tokens
  }

  pub(crate) fn remember_token_registration(
    &self,
    token: ExpirationToken,
    registration: TokenRegistration,
  ) {
    self.token_registrations.lock().push((token, registration));
  }

  /// Withdraws this entry's callbacks from its expiration tokens.
  pub(crate) fn unregister_tokens(&self) {
    let registrations = std::mem::take(&mut *self.token_registrations.lock());
    for (token, registration) in registrations {
      token.unregister(registration);
    }
  }

  /// Appends a callback unless the entry has already been evicted, in which
  /// case the callback is dropped and `false` is returned.
  pub(crate) fn push_callback(&self, callback: PostEvictionCallback<K, V>) -> bool {
    let mut callbacks = self.callbacks.lock();
    if self.is_evicted() {
      return false;
    }
    callbacks.push(callback);
    true
  }

  /// Takes the callbacks for execution. Call only after `mark_evicted`.
  pub(crate) fn take_callbacks(&self) -> Vec<PostEvictionCallback<K, V>> {
    std::mem::take(&mut *self.callbacks.lock())
  }

  /// Claims the cascade hook slot. Returns `true` for the first caller only.
  pub(crate) fn claim_cascade(&self) -> bool {
    !self.cascade_attached.swap(true, Ordering::AcqRel)
  }

  /// Marks the entry evicted. Returns `true` for the first caller only, so
  /// eviction work runs at most once per entry.
  pub(crate) fn mark_evicted(&self) -> bool {
    !self.evicted.swap(true, Ordering::AcqRel)
  }

  pub(crate) fn is_evicted(&self) -> bool {
    self.evicted.load(Ordering::Acquire)
  }
}
