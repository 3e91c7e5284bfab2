use crate::clock::to_nanos;
use crate::entry::{CacheEntry, CacheItemPriority, EntrySettings};
use crate::error::{BoxError, CacheError};
use crate::eviction::PriorityCallback;
use crate::listener::{EvictionReason, PostEvictionCallback};
use crate::lock::KeyLockGuard;
use crate::shared::StoreShared;
use crate::token::ExpirationToken;

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::unsync::OnceCell;
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Propagated {
  absolute_expiration: Option<Instant>,
  tokens: Vec<ExpirationToken>,
}

/// An explicit handle through which entries created while building another
/// entry hand their expiration to it.
///
/// Obtain one from the outer builder with [`EntryBuilder::parent_link`] and
/// pass it to each inner builder with [`EntryBuilder::link_parent`]. When an
/// inner entry commits, its absolute expiration and expiration tokens are
/// recorded in the link; the outer entry adopts the earliest expiration and
/// all tokens when it commits.
#[derive(Clone, Default)]
pub struct ParentLink {
  inner: Arc<Mutex<Propagated>>,
}

impl fmt::Debug for ParentLink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let inner = self.inner.lock();
    f.debug_struct("ParentLink")
      .field("absolute_expiration", &inner.absolute_expiration)
      .field("tokens", &inner.tokens.len())
      .finish()
  }
}

impl ParentLink {
  fn propagate(&self, absolute_expiration: Option<Instant>, tokens: &[ExpirationToken]) {
    let mut inner = self.inner.lock();
    inner.absolute_expiration = earliest(inner.absolute_expiration, absolute_expiration);
    inner.tokens.extend(tokens.iter().cloned());
  }

  fn take(&self) -> Propagated {
    std::mem::take(&mut *self.inner.lock())
  }
}

fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
  match (a, b) {
    (Some(a), Some(b)) => Some(a.min(b)),
    (a, None) => a,
    (None, b) => b,
  }
}

/// A pending entry for a single key.
///
/// The builder holds the key lock from [`CacheStore::create_entry`] until it
/// is committed or dropped, so every read, replace or removal of the key by
/// other threads waits for it. Dropping it without committing leaves the
/// cache unchanged.
///
/// [`CacheStore::create_entry`]: crate::CacheStore::create_entry
pub struct EntryBuilder<'a, K, V, H = ahash::RandomState> {
  pub(crate) shared: &'a StoreShared<K, V, H>,
  pub(crate) guard: KeyLockGuard<'a, K>,
  size: u64,
  priority: CacheItemPriority,
  absolute_expiration: Option<Instant>,
  relative_expiration: Option<Duration>,
  sliding_expiration: Option<Duration>,
  callbacks: Vec<PostEvictionCallback<K, V>>,
  priority_callbacks: Vec<(PriorityCallback<K, V>, i32)>,
  tokens: Vec<ExpirationToken>,
  depends_on: Vec<K>,
  parent: Option<ParentLink>,
  link: OnceCell<ParentLink>,
}

impl<K: fmt::Debug, V, H> fmt::Debug for EntryBuilder<'_, K, V, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntryBuilder")
      .field("key", self.guard.key())
      .field("size", &self.size)
      .field("priority", &self.priority)
      .field("absolute_expiration", &self.absolute_expiration)
      .field("relative_expiration", &self.relative_expiration)
      .field("sliding_expiration", &self.sliding_expiration)
      .field("callbacks", &self.callbacks.len())
      .field("priority_callbacks", &self.priority_callbacks.len())
      .finish_non_exhaustive()
  }
}

impl<'a, K, V, H> EntryBuilder<'a, K, V, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  pub(crate) fn new(shared: &'a StoreShared<K, V, H>, guard: KeyLockGuard<'a, K>) -> Self {
    Self {
      shared,
      guard,
      size: 1,
      priority: CacheItemPriority::Normal,
      absolute_expiration: None,
      relative_expiration: None,
      sliding_expiration: None,
      callbacks: Vec::new(),
      priority_callbacks: Vec::new(),
      tokens: Vec::new(),
      depends_on: Vec::new(),
      parent: None,
      link: OnceCell::new(),
    }
  }

  /// The key this builder holds locked.
  pub fn key(&self) -> &K {
    self.guard.key()
  }

  /// The live value currently stored under the key, if any.
  ///
  /// The lock is held, so the answer stays true until this builder commits
  /// or is dropped.
  pub fn current(&self) -> Option<Arc<V>> {
    self.shared.live_entry(self.key()).map(|entry| entry.value())
  }

  /// The size charged against the cache's size limit. Defaults to 1.
  pub fn size(mut self, size: u64) -> Self {
    self.size = size;
    self
  }

  pub fn priority(mut self, priority: CacheItemPriority) -> Self {
    self.priority = priority;
    self
  }

  /// Expires the entry at `at`, measured on the cache's clock.
  pub fn absolute_expiration(mut self, at: Instant) -> Self {
    self.absolute_expiration = Some(at);
    self
  }

  /// Expires the entry `ttl` after it is committed.
  pub fn absolute_expiration_relative_to_now(mut self, ttl: Duration) -> Self {
    self.relative_expiration = Some(ttl);
    self
  }

  /// Expires the entry once it has not been read for `idle`.
  pub fn sliding_expiration(mut self, idle: Duration) -> Self {
    self.sliding_expiration = Some(idle);
    self
  }

  /// Adds a callback run after the entry leaves the cache, in the order the
  /// callbacks were added.
  pub fn post_eviction_callback<F>(mut self, callback: F) -> Self
  where
    F: Fn(&K, &Arc<V>, EvictionReason) -> Result<(), BoxError> + Send + Sync + 'static,
  {
    self.callbacks.push(Arc::new(callback));
    self
  }

  /// Queues a callback on the key's priority queue. Priority callbacks run
  /// once per removal, smaller priorities first, and wait for every
  /// [`add_ref`](crate::CacheStore::add_ref) on the key to be released.
  pub fn priority_callback<F>(mut self, priority: i32, callback: F) -> Self
  where
    F: FnOnce(&K, &Arc<V>, EvictionReason) -> Result<(), BoxError> + Send + 'static,
  {
    self.priority_callbacks.push((Box::new(callback), priority));
    self
  }

  /// Evicts the entry with `TokenExpired` when `token` is cancelled.
  pub fn expiration_token(mut self, token: ExpirationToken) -> Self {
    self.tokens.push(token);
    self
  }

  /// Cancels `token` when the entry is evicted, whatever the reason.
  pub fn cancel_on_eviction(mut self, token: ExpirationToken) -> Self {
    self.callbacks.push(Arc::new(
      move |_: &K, _: &Arc<V>, _: EvictionReason| -> Result<(), BoxError> {
        token.cancel();
        Ok(())
      },
    ));
    self
  }

  /// Evicts this entry with `Dependency` whenever the entry under `target`
  /// is evicted. Edges are checked for cycles on commit, and replace any
  /// edges the key had before.
  pub fn depends_on(mut self, target: K) -> Self {
    self.depends_on.push(target);
    self
  }

  /// Propagates this entry's expiration to the builder that owns `link`.
  pub fn link_parent(mut self, link: &ParentLink) -> Self {
    self.parent = Some(link.clone());
    self
  }

  /// A handle that inner entries can propagate their expiration through.
  pub fn parent_link(&self) -> ParentLink {
    self.link.get_or_init(ParentLink::default).clone()
  }

  /// Publishes `value` under the key, replacing and evicting any previous
  /// entry, and releases the key lock.
  pub fn commit(self, value: V) -> Result<Arc<V>, CacheError> {
    let shared = self.shared;
    shared.ensure_live()?;
    if let Some(limit) = shared.compactor.size_limit() {
      if self.size > limit {
        return Err(CacheError::EntryTooLarge {
          size: self.size,
          limit,
        });
      }
    }

    let key = self.guard.key().clone();
    shared.set_dependencies(&key, &self.depends_on)?;

    let now = shared.clock.now();
    let mut absolute_expiration = earliest(
      self.absolute_expiration,
      self.relative_expiration.and_then(|ttl| now.checked_add(ttl)),
    );
    let mut tokens = self.tokens;
    if let Some(link) = self.link.into_inner() {
      let inner = link.take();
      absolute_expiration = earliest(absolute_expiration, inner.absolute_expiration);
      tokens.extend(inner.tokens);
    }
    if let Some(parent) = &self.parent {
      parent.propagate(absolute_expiration, &tokens);
    }

    let entry = Arc::new(CacheEntry::new(
      Arc::new(value),
      EntrySettings {
        size: self.size,
        priority: self.priority,
        absolute_expiration: absolute_expiration.map(to_nanos),
        sliding_expiration: self.sliding_expiration,
        tokens,
        callbacks: self.callbacks,
      },
      to_nanos(now),
    ));
    let value = entry.value();

    shared.publish(&key, entry, self.priority_callbacks);

    drop(self.guard);
    shared.after_commit();
    Ok(value)
  }
}
